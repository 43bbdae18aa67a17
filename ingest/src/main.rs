// This file is part of a security camera network recording coordinator.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `camrig-ingestd`: the ingest server. Accepts chunked
//! uploads from recording nodes, verifies checksums end to end, and
//! publishes a session once every expected camera has confirmed.

use base::Error;
use bpaf::Parser;
use std::ffi::OsStr;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

mod store;
mod web;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug)]
struct Args {
    listen: SocketAddr,
    storage_root: PathBuf,
    session_complete_timeout_secs: u64,
}

/// `camrig-ingestd`: receives and publishes recordings uploaded by camera nodes.
fn args() -> impl Parser<Args> {
    let listen = bpaf::long("listen")
        .help("Address to bind the ingest HTTP API to.")
        .argument::<SocketAddr>("ADDR")
        .fallback("0.0.0.0:9000".parse().unwrap())
        .debug_fallback();
    let storage_root = bpaf::long("storage-root")
        .help("Root directory under which uploaded recordings and the bookkeeping database are stored.")
        .argument::<PathBuf>("PATH")
        .fallback("/var/lib/camrig-ingest".into())
        .debug_fallback();
    let session_complete_timeout_secs = bpaf::long("session-complete-timeout-secs")
        .help("How long a session may sit partially confirmed before it's marked PARTIAL.")
        .argument::<u64>("SECONDS")
        .fallback(3600)
        .debug_fallback();
    bpaf::construct!(Args {
        listen,
        storage_root,
        session_complete_timeout_secs,
    })
    .to_options()
    .version(VERSION)
}

#[tokio::main]
async fn main() {
    base::tracing_setup::install();

    let progname = std::env::args_os().next().map(PathBuf::from);
    let progname = progname
        .as_deref()
        .and_then(Path::file_name)
        .and_then(OsStr::to_str)
        .unwrap_or(env!("CARGO_PKG_NAME"));

    let args = match args().run_inner(bpaf::Args::current_args().set_name(progname)) {
        Ok(a) => a,
        Err(e) => std::process::exit(e.exit_code()),
    };

    if let Err(e) = run(args).await {
        error!(err = %e.chain(), "exiting due to error");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Error> {
    let store = Arc::new(store::Store::open(args.storage_root)?);

    let expire_store = Arc::clone(&store);
    let timeout = Duration::from_secs(args.session_complete_timeout_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            if let Err(e) = expire_store.expire_incomplete_sessions(timeout) {
                error!(err = %e.chain(), "session expiry sweep failed");
            }
        }
    });

    info!(listen = %args.listen, "starting ingest server");
    web::serve(store, args.listen).await
}
