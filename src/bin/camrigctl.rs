// This file is part of a security camera network recording coordinator.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `camrigctl`: operator CLI for the Coordinator API exposed by any
//! `camrigd` node. Exit codes: 0 success; 2 precondition failure; 3 peer
//! unreachable; 4 upload verification failure; 1 generic error.

use base::Error;
use bpaf::{Bpaf, Parser};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error};

// Set by build.rs from `git describe`, falling back to the `VERSION` env var if present.
const VERSION: &str = env!("VERSION");
const DEFAULT_ENDPOINT: &str = "127.0.0.1:8080";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

fn endpoint() -> impl Parser<String> {
    bpaf::long("endpoint")
        .help("host:port of any node's Coordinator API.")
        .argument::<String>("HOST:PORT")
        .fallback(DEFAULT_ENDPOINT.to_string())
        .debug_fallback()
}

#[derive(Bpaf, Debug)]
#[bpaf(options, version(VERSION))]
enum Args {
    /// Aggregate status across all known peers.
    #[bpaf(command)]
    Status {
        #[bpaf(external(endpoint))]
        endpoint: String,
    },
    /// Aggregate preflight check, no mutations.
    #[bpaf(command)]
    Preflight {
        #[bpaf(external(endpoint))]
        endpoint: String,
    },
    /// Two-phase cluster start; generates a session id unless one is given.
    #[bpaf(command)]
    Start {
        #[bpaf(external(endpoint))]
        endpoint: String,
        #[bpaf(long("session-id"), argument("ID"))]
        session_id: Option<String>,
    },
    /// Cluster-wide stop.
    #[bpaf(command)]
    Stop {
        #[bpaf(external(endpoint))]
        endpoint: String,
    },
    /// Trigger a sync pass on all nodes.
    #[bpaf(command)]
    Sync {
        #[bpaf(external(endpoint))]
        endpoint: String,
    },
    /// 10-s end-to-end recording test.
    #[bpaf(command)]
    Test {
        #[bpaf(external(endpoint))]
        endpoint: String,
    },
    /// Peer registry administration.
    #[bpaf(command)]
    Peers {
        #[bpaf(external(endpoint))]
        endpoint: String,
        #[bpaf(external(peers_cmd))]
        cmd: PeersCmd,
    },
}

#[derive(Bpaf, Debug)]
enum PeersCmd {
    #[bpaf(command)]
    List,
    #[bpaf(command)]
    Add {
        #[bpaf(positional("NODE_ID"))]
        node_id: String,
        #[bpaf(positional("HOST:PORT"))]
        peer_endpoint: String,
    },
    #[bpaf(command)]
    Remove {
        #[bpaf(positional("NODE_ID"))]
        node_id: String,
    },
}

impl Args {
    async fn run(self) -> Result<i32, Error> {
        match self {
            Args::Status { endpoint } => cmd_status(&endpoint).await,
            Args::Preflight { endpoint } => cmd_preflight(&endpoint).await,
            Args::Start { endpoint, session_id } => cmd_start(&endpoint, session_id).await,
            Args::Stop { endpoint } => cmd_stop(&endpoint).await,
            Args::Sync { endpoint } => cmd_sync(&endpoint).await,
            Args::Test { endpoint } => cmd_test(&endpoint).await,
            Args::Peers { endpoint, cmd } => cmd_peers(&endpoint, cmd).await,
        }
    }
}

fn print_json<T: serde::Serialize>(v: &T) {
    println!("{}", serde_json::to_string_pretty(v).expect("response always serializes"));
}

async fn get<T: for<'de> serde::Deserialize<'de>>(endpoint: &str, path: &str) -> Result<T, Error> {
    let client = camrig_node::http_client::new_client();
    camrig_node::http_client::request_json(&client, hyper::Method::GET, &format!("http://{endpoint}{path}"), None::<&()>, DEFAULT_TIMEOUT).await
}

async fn post<Req: serde::Serialize, T: for<'de> serde::Deserialize<'de>>(
    endpoint: &str,
    path: &str,
    body: Option<&Req>,
) -> Result<T, Error> {
    let client = camrig_node::http_client::new_client();
    camrig_node::http_client::request_json(&client, hyper::Method::POST, &format!("http://{endpoint}{path}"), body, DEFAULT_TIMEOUT).await
}

/// Maps a failed RPC to the CLI's exit-code taxonomy.
fn exit_code_for(e: &Error) -> i32 {
    match e.kind() {
        base::ErrorKind::Unavailable | base::ErrorKind::DeadlineExceeded => 3,
        base::ErrorKind::FailedPrecondition => 2,
        base::ErrorKind::DataLoss => 4,
        _ => 1,
    }
}

async fn cmd_status(endpoint: &str) -> Result<i32, Error> {
    let status: core::coordinator::AggregateStatus = get(endpoint, "/coordinator/status").await?;
    print_json(&status);
    Ok(0)
}

async fn cmd_preflight(endpoint: &str) -> Result<i32, Error> {
    let report: core::coordinator::AggregatePreflight = post::<(), _>(endpoint, "/coordinator/preflight", None).await?;
    print_json(&report);
    Ok(if report.passed { 0 } else { 2 })
}

#[derive(serde::Serialize)]
struct StartBody {
    session_id: Option<String>,
}

async fn cmd_start(endpoint: &str, session_id: Option<String>) -> Result<i32, Error> {
    let resp: core::coordinator::StartResponse = post(endpoint, "/coordinator/start", Some(&StartBody { session_id })).await?;
    print_json(&resp);
    Ok(if resp.success { 0 } else { 2 })
}

async fn cmd_stop(endpoint: &str) -> Result<i32, Error> {
    let resp: core::coordinator::StopResponse = post::<(), _>(endpoint, "/coordinator/stop", None).await?;
    print_json(&resp);
    Ok(0)
}

async fn cmd_sync(endpoint: &str) -> Result<i32, Error> {
    let resp: serde_json::Value = post::<(), _>(endpoint, "/coordinator/sync", None).await?;
    print_json(&resp);
    Ok(0)
}

async fn cmd_test(endpoint: &str) -> Result<i32, Error> {
    let resp: serde_json::Value = post::<(), _>(endpoint, "/coordinator/test", None).await?;
    print_json(&resp);
    let success = resp.get("success").and_then(serde_json::Value::as_bool).unwrap_or(false);
    Ok(if success { 0 } else { 2 })
}

async fn cmd_peers(endpoint: &str, cmd: PeersCmd) -> Result<i32, Error> {
    match cmd {
        PeersCmd::List => {
            let peers: Vec<core::peers::PeerEntry> = get(endpoint, "/coordinator/peers").await?;
            print_json(&peers);
        }
        PeersCmd::Add { node_id, peer_endpoint } => {
            #[derive(serde::Serialize)]
            struct Body {
                node_id: String,
                endpoint: String,
            }
            let resp: serde_json::Value =
                post(endpoint, "/coordinator/peers", Some(&Body { node_id, endpoint: peer_endpoint })).await?;
            print_json(&resp);
        }
        PeersCmd::Remove { node_id } => {
            let client = camrig_node::http_client::new_client();
            let resp: serde_json::Value = camrig_node::http_client::request_json(
                &client,
                hyper::Method::DELETE,
                &format!("http://{endpoint}/coordinator/peers/{node_id}"),
                None::<&()>,
                DEFAULT_TIMEOUT,
            )
            .await?;
            print_json(&resp);
        }
    }
    Ok(0)
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

    let args = match args().fallback_to_usage().run_inner(bpaf::Args::current_args().set_name(progname)) {
        Ok(a) => a,
        Err(e) => std::process::exit(e.exit_code()),
    };
    debug!("parsed command-line arguments: {args:#?}");

    match args.run().await {
        Err(e) => {
            error!(err = %e.chain(), "command failed");
            std::process::exit(exit_code_for(&e));
        }
        Ok(rv) => std::process::exit(rv),
    }
}
