// SPDX-License-Identifier: Apache-2.0

//! Thin signing client, implementing the wire contract of spec §4.5 with
//! no knowledge of the daemon's internals: open the resolution
//! subscription before submitting the request, then wait for the matching
//! `request_resolved` message.

use std::io::{Read, Write};
use std::path::PathBuf;

use base64::Engine;
use bytes::Bytes;
use clap::Parser;
use futures::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use sd_types::{GpgSignInfo, RequestId, Resolution, WsMessage};
use tokio::net::UnixStream;
use tokio_tungstenite::tungstenite::Message as WsMsg;

/// Exit code for a denial, cancellation, or timeout (spec §6).
const EXIT_DENIED: i32 = 1;
/// Exit code for a daemon-unreachable or credential-missing system error.
const EXIT_SYSTEM_ERROR: i32 = 2;

fn default_socket_path() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("secrets-dispatcher/api.sock")
}

fn default_credential_path() -> PathBuf {
    std::env::var_os("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(|home| PathBuf::from(home).join(".local/state"))
                .unwrap_or_else(|| PathBuf::from("/tmp"))
        })
        .join("secrets-dispatcher/.cookie")
}

#[derive(Debug, Parser)]
#[command(name = "gpg-sign", version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[arg(long, env = "SD_SOCKET_PATH")]
    socket_path: Option<PathBuf>,

    #[arg(long, env = "SD_CREDENTIAL_PATH")]
    credential_path: Option<PathBuf>,

    #[arg(long)]
    repo_name: String,

    #[arg(long, default_value = "")]
    commit_msg: String,

    #[arg(long)]
    author: String,

    #[arg(long)]
    committer: String,

    #[arg(long)]
    key_id: String,

    #[arg(long)]
    fingerprint: Option<String>,

    #[arg(long = "changed-file")]
    changed_files: Vec<String>,

    #[arg(long)]
    parent_hash: Option<String>,

    /// Free-text label identifying the calling tool, e.g. `git`.
    #[arg(long, default_value = "gpg-sign")]
    client: String,
}

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    let cli = Cli::parse();

    let socket_path = cli.socket_path.clone().unwrap_or_else(default_socket_path);
    let credential_path = cli
        .credential_path
        .clone()
        .unwrap_or_else(default_credential_path);

    let credential = match std::fs::read_to_string(&credential_path) {
        Ok(contents) => contents.trim().to_string(),
        Err(err) => {
            eprintln!("gpg-sign: failed to read credential at {}: {err}", credential_path.display());
            return EXIT_SYSTEM_ERROR;
        }
    };

    let mut commit_object = Vec::new();
    if let Err(err) = std::io::stdin().read_to_end(&mut commit_object) {
        eprintln!("gpg-sign: failed to read commit object from stdin: {err}");
        return EXIT_SYSTEM_ERROR;
    }

    let info = GpgSignInfo {
        repo_name: cli.repo_name,
        commit_msg: cli.commit_msg,
        author: cli.author,
        committer: cli.committer,
        key_id: cli.key_id,
        fingerprint: cli.fingerprint,
        changed_files: cli.changed_files,
        parent_hash: cli.parent_hash,
        commit_object,
    };

    // Open the subscription before submitting the request: posting first
    // could race a fast resolution and miss the `request_resolved` event.
    let mut ws = match open_subscription(&socket_path, &credential).await {
        Ok(ws) => ws,
        Err(err) => {
            eprintln!("gpg-sign: failed to open subscription: {err}");
            return EXIT_SYSTEM_ERROR;
        }
    };

    let request_id = match submit_request(&socket_path, &credential, &cli.client, info).await {
        Ok(id) => id,
        Err(err) => {
            eprintln!("gpg-sign: failed to submit signing request: {err}");
            return EXIT_SYSTEM_ERROR;
        }
    };

    let mut sigint = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
    {
        Ok(s) => s,
        Err(_) => return wait_for_resolution(&mut ws, request_id).await,
    };
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(s) => s,
        Err(_) => return wait_for_resolution(&mut ws, request_id).await,
    };

    tokio::select! {
        code = wait_for_resolution(&mut ws, request_id) => code,
        _ = sigint.recv() => {
            best_effort_cancel(&socket_path, &credential, request_id).await;
            EXIT_DENIED
        }
        _ = sigterm.recv() => {
            best_effort_cancel(&socket_path, &credential, request_id).await;
            EXIT_DENIED
        }
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<UnixStream>;

async fn open_subscription(socket_path: &std::path::Path, credential: &str) -> anyhow::Result<WsStream> {
    let stream = UnixStream::connect(socket_path).await?;
    let request = http::Request::builder()
        .uri("ws://localhost/api/v1/ws")
        .header("Host", "localhost")
        .header("Authorization", format!("Bearer {credential}"))
        .body(())?;
    let (ws, _response) = tokio_tungstenite::client_async(request, stream).await?;
    Ok(ws)
}

async fn submit_request(
    socket_path: &std::path::Path,
    credential: &str,
    client_label: &str,
    info: GpgSignInfo,
) -> anyhow::Result<RequestId> {
    #[derive(serde::Serialize)]
    struct Body<'a> {
        client: &'a str,
        gpg_sign_info: GpgSignInfo,
    }
    #[derive(serde::Deserialize)]
    struct Reply {
        request_id: RequestId,
    }

    let body = serde_json::to_vec(&Body {
        client: client_label,
        gpg_sign_info: info,
    })?;

    let reply: Reply = post_json(socket_path, credential, "/api/v1/gpg-sign/request", body).await?;
    Ok(reply.request_id)
}

async fn best_effort_cancel(socket_path: &std::path::Path, credential: &str, id: RequestId) {
    let path = format!("/api/v1/pending/{id}/cancel");
    let _ = post_json::<serde_json::Value>(socket_path, credential, &path, Vec::new()).await;
}

async fn post_json<T: serde::de::DeserializeOwned>(
    socket_path: &std::path::Path,
    credential: &str,
    path: &str,
    body: Vec<u8>,
) -> anyhow::Result<T> {
    let client = Client::builder(TokioExecutor::new()).build(hyperlocal::UnixConnector);
    let uri = hyperlocal::Uri::new(socket_path, path).into();
    let request = hyper::Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("Authorization", format!("Bearer {credential}"))
        .body(Full::new(Bytes::from(body)))?;
    let response = client.request(request).await?;
    let body = response.into_body().collect().await?.to_bytes();
    Ok(serde_json::from_slice(&body)?)
}

/// Reads subscription messages until `id`'s `request_resolved` arrives,
/// ignoring every other message and every other request's resolution.
async fn wait_for_resolution(ws: &mut WsStream, id: RequestId) -> i32 {
    loop {
        let message = match ws.next().await {
            Some(Ok(WsMsg::Text(text))) => text,
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                eprintln!("gpg-sign: subscription error: {err}");
                return EXIT_SYSTEM_ERROR;
            }
            None => {
                eprintln!("gpg-sign: subscription closed before resolution arrived");
                return EXIT_SYSTEM_ERROR;
            }
        };
        let Ok(parsed) = serde_json::from_str::<WsMessage>(&message) else {
            continue;
        };
        let WsMessage::RequestResolved {
            id: resolved_id,
            resolution,
            signature,
            gpg_status,
            exit_code,
        } = parsed
        else {
            continue;
        };
        if resolved_id != id {
            continue;
        }
        let _ = ws.close(None).await;
        return deliver_outcome(resolution, signature, gpg_status, exit_code);
    }
}

fn deliver_outcome(
    resolution: Resolution,
    signature: Option<String>,
    gpg_status: Option<String>,
    exit_code: Option<i32>,
) -> i32 {
    match resolution {
        Resolution::Denied | Resolution::Expired | Resolution::Cancelled => EXIT_DENIED,
        Resolution::Approved | Resolution::AutoApproved => {
            if let Some(status) = &gpg_status {
                eprint!("{status}");
            }
            match exit_code {
                Some(code) if code != 0 => code,
                _ => {
                    let Some(signature) = signature else {
                        eprintln!("gpg-sign: daemon reported success with no signature");
                        return EXIT_SYSTEM_ERROR;
                    };
                    match base64::engine::general_purpose::STANDARD.decode(signature) {
                        Ok(bytes) => {
                            if std::io::stdout().write_all(&bytes).is_err() {
                                return EXIT_SYSTEM_ERROR;
                            }
                            0
                        }
                        Err(err) => {
                            eprintln!("gpg-sign: malformed signature encoding: {err}");
                            EXIT_SYSTEM_ERROR
                        }
                    }
                }
            }
        }
    }
}
