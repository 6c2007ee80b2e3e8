//! RPC Facade: a thin newline-delimited JSON protocol over a Unix domain
//! socket, translating client requests directly into Registry calls.

use std::path::Path;
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use crate::error::DaemonResult;
use crate::registry::Registry;
use crate::tunnel::TunnelView;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    CreateTunnel {
        host: String,
        local_port: u16,
        remote_port: u16,
    },
    CloseTunnel {
        host: String,
        remote_port: u16,
    },
    CloseAllTunnels,
    ListTunnels,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TunnelInfo {
    pub host: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub created_at: u64,
    pub last_activity: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub bandwidth_up: f64,
    pub bandwidth_down: f64,
    pub active_conns: i32,
    pub total_conns: u64,
}

impl From<TunnelView> for TunnelInfo {
    fn from(view: TunnelView) -> Self {
        Self {
            host: view.host,
            local_port: view.local_port,
            remote_port: view.remote_port,
            created_at: view.meter.created_at_unix,
            last_activity: view.meter.last_activity_unix,
            bytes_sent: view.meter.bytes_sent,
            bytes_received: view.meter.bytes_received,
            bandwidth_up: view.meter.bandwidth_up,
            bandwidth_down: view.meter.bandwidth_down,
            active_conns: view.meter.active_conns,
            total_conns: view.meter.total_conns,
        }
    }
}

#[derive(Debug, Serialize, Default)]
struct Reply {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tunnels: Option<Vec<TunnelInfo>>,
}

impl Reply {
    fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    fn ok_count(count: usize) -> Self {
        Self {
            success: true,
            count: Some(count),
            ..Default::default()
        }
    }

    fn ok_tunnels(tunnels: Vec<TunnelInfo>) -> Self {
        Self {
            success: true,
            tunnels: Some(tunnels),
            ..Default::default()
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Binds `socket_path`, replacing any stale socket left behind by a
/// previous run, and serves requests until `shutdown` fires.
pub async fn serve(socket_path: &Path, registry: Arc<Registry>, shutdown: CancellationToken) -> DaemonResult<()> {
    if socket_path.exists() {
        let _ = std::fs::remove_file(socket_path);
    }
    let listener = UnixListener::bind(socket_path)?;
    info!("RPC facade listening on {}", socket_path.display());

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let registry = Arc::clone(&registry);
                        tokio::spawn(async move {
                            handle_client(stream, registry).await;
                        });
                    }
                    Err(e) => warn!("RPC accept failed: {e}"),
                }
            }
        }
    }

    let _ = std::fs::remove_file(socket_path);
    Ok(())
}

async fn handle_client(stream: UnixStream, registry: Arc<Registry>) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("RPC connection read error: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<Request>(&line) {
            Ok(request) => dispatch(&registry, request).await,
            Err(e) => Reply::err(format!("invalid request: {e}")),
        };

        let mut encoded = serde_json::to_string(&reply).unwrap_or_else(|_| "{\"success\":false}".to_string());
        encoded.push('\n');
        if writer.write_all(encoded.as_bytes()).await.is_err() {
            break;
        }
    }
}

async fn dispatch(registry: &Registry, request: Request) -> Reply {
    match request {
        Request::CreateTunnel {
            host,
            local_port,
            remote_port,
        } => match registry.create(host, local_port, remote_port).await {
            Ok(()) => Reply::ok(),
            Err(e) => Reply::err(e.to_string()),
        },
        Request::CloseTunnel { host, remote_port } => match registry.close(&host, remote_port).await {
            Ok(()) => Reply::ok(),
            Err(e) => Reply::err(e.to_string()),
        },
        Request::CloseAllTunnels => Reply::ok_count(registry.close_all().await),
        Request::ListTunnels => {
            let tunnels = registry.list().await.into_iter().map(TunnelInfo::from).collect();
            Reply::ok_tunnels(tunnels)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_format_matches_snake_case_tag() {
        let req: Request = serde_json::from_str(
            r#"{"op":"create_tunnel","host":"db.internal","local_port":15432,"remote_port":5432}"#,
        )
        .unwrap();
        match req {
            Request::CreateTunnel {
                host,
                local_port,
                remote_port,
            } => {
                assert_eq!(host, "db.internal");
                assert_eq!(local_port, 15432);
                assert_eq!(remote_port, 5432);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn list_tunnels_has_no_payload_fields() {
        let req: Request = serde_json::from_str(r#"{"op":"list_tunnels"}"#).unwrap();
        assert!(matches!(req, Request::ListTunnels));
    }

    #[test]
    fn error_reply_omits_empty_optional_fields() {
        let reply = Reply::err("boom");
        let encoded = serde_json::to_string(&reply).unwrap();
        assert!(encoded.contains("\"success\":false"));
        assert!(encoded.contains("\"error\":\"boom\""));
        assert!(!encoded.contains("\"tunnels\""));
        assert!(!encoded.contains("\"count\""));
    }
}
