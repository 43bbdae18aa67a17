// This file is part of a security camera network recording coordinator.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Thin hyper-based JSON client shared by the peer and ingest clients
//!. Both talk plain JSON over HTTP/1.1 to other nodes and
//! to the ingest server, so the request/response plumbing lives here once.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

pub type HttpClient = Client<HttpConnector, Full<Bytes>>;

pub fn new_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build_http()
}

/// Sends `body` (if any) as JSON to `url` and decodes the response as JSON,
/// failing with a classified [`base::Error`] on timeout, transport error, or
/// non-2xx status.
pub async fn request_json<Req: Serialize, Resp: DeserializeOwned>(
    client: &HttpClient,
    method: Method,
    url: &str,
    body: Option<&Req>,
    timeout: Duration,
) -> Result<Resp, base::Error> {
    let body_bytes = match body {
        Some(b) => {
            serde_json::to_vec(b).map_err(|e| base::format_err_t!(Internal, "encoding request to {url}: {e}"))?
        }
        None => Vec::new(),
    };
    let req = Request::builder()
        .method(method)
        .uri(url)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body_bytes)))
        .map_err(|e| base::format_err_t!(Internal, "building request to {url}: {e}"))?;

    let send = client.request(req);
    let resp = tokio::time::timeout(timeout, send)
        .await
        .map_err(|_| base::format_err_t!(Unavailable, "{url} exceeded {timeout:?} deadline"))?
        .map_err(|e| base::format_err_t!(Unavailable, "connecting to {url}: {e}"))?;

    let status = resp.status();
    let bytes = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| base::format_err_t!(Unavailable, "reading response from {url}: {e}"))?
        .to_bytes();

    if !status.is_success() {
        let msg = String::from_utf8_lossy(&bytes);
        return Err(base::Error::new(kind_for_status(status), format!("{url} returned {status}: {msg}")));
    }
    if bytes.is_empty() {
        // Callers expecting `()` decode an empty body fine; anything else is a bug.
        return serde_json::from_slice(b"null")
            .map_err(|e| base::format_err_t!(Internal, "decoding empty response from {url}: {e}"));
    }
    serde_json::from_slice(&bytes).map_err(|e| base::format_err_t!(Internal, "decoding response from {url}: {e}"))
}

fn kind_for_status(status: StatusCode) -> base::ErrorKind {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => base::ErrorKind::InvalidArgument,
        StatusCode::NOT_FOUND => base::ErrorKind::NotFound,
        StatusCode::CONFLICT => base::ErrorKind::AlreadyExists,
        StatusCode::PRECONDITION_FAILED => base::ErrorKind::FailedPrecondition,
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => base::ErrorKind::PermissionDenied,
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => base::ErrorKind::Unavailable,
        s if s.is_server_error() => base::ErrorKind::Internal,
        _ => base::ErrorKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_kinds_cover_the_peer_error_taxonomy() {
        assert_eq!(kind_for_status(StatusCode::CONFLICT), base::ErrorKind::AlreadyExists);
        assert_eq!(kind_for_status(StatusCode::PRECONDITION_FAILED), base::ErrorKind::FailedPrecondition);
        assert_eq!(kind_for_status(StatusCode::SERVICE_UNAVAILABLE), base::ErrorKind::Unavailable);
        assert_eq!(kind_for_status(StatusCode::INTERNAL_SERVER_ERROR), base::ErrorKind::Internal);
        assert_eq!(kind_for_status(StatusCode::IM_A_TEAPOT), base::ErrorKind::Unknown);
    }
}
