//! Tunnel Registry: the single source of truth for which tunnels exist,
//! keyed by `(host, remote_port)`. Holds the map lock only across mutation
//! and handoff, never across network I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::RwLock;

use crate::config::{ConnectionLimits, SshCredentials};
use crate::error::{DaemonError, DaemonResult};
use crate::tunnel::{ConnectionLimiter, Tunnel, TunnelKey, TunnelSpec, TunnelView};

pub struct Registry {
    tunnels: RwLock<HashMap<TunnelKey, Arc<Tunnel>>>,
    credentials: SshCredentials,
    limiter: Arc<SyncMutex<ConnectionLimiter>>,
}

impl Registry {
    pub fn new(credentials: SshCredentials, limits: ConnectionLimits) -> Self {
        let limiter = Arc::new(SyncMutex::new(ConnectionLimiter::new(
            limits.max_attempts,
            Duration::from_secs(limits.retry_window_secs),
        )));

        Self {
            tunnels: RwLock::new(HashMap::new()),
            credentials,
            limiter,
        }
    }

    /// Dials and binds a new tunnel, then registers it — rejecting the
    /// request outright if `(host, remote_port)` is already taken.
    pub async fn create(&self, host: String, local_port: u16, remote_port: u16) -> DaemonResult<()> {
        let key = TunnelKey {
            host: host.clone(),
            remote_port,
        };

        {
            let existing = self.tunnels.read().await;
            if existing.contains_key(&key) {
                return Err(DaemonError::AlreadyExists { host, remote_port });
            }
        }

        let spec = TunnelSpec {
            host: host.clone(),
            local_port,
            remote_port,
        };
        let tunnel = Tunnel::create(spec, self.credentials.clone(), Arc::clone(&self.limiter)).await?;
        tunnel.start();

        let mut map = self.tunnels.write().await;
        if map.contains_key(&key) {
            drop(map);
            tunnel.close().await;
            return Err(DaemonError::AlreadyExists { host, remote_port });
        }
        map.insert(key, tunnel);
        Ok(())
    }

    pub async fn close(&self, host: &str, remote_port: u16) -> DaemonResult<()> {
        let key = TunnelKey {
            host: host.to_string(),
            remote_port,
        };
        let tunnel = {
            let mut map = self.tunnels.write().await;
            map.remove(&key)
        };

        match tunnel {
            Some(t) => {
                t.close().await;
                Ok(())
            }
            None => Err(DaemonError::NotFound {
                host: host.to_string(),
                remote_port,
            }),
        }
    }

    /// Removes and closes every tunnel, returning how many were closed.
    /// Closes run concurrently so one slow teardown does not hold up the
    /// rest.
    pub async fn close_all(&self) -> usize {
        let tunnels: Vec<Arc<Tunnel>> = {
            let mut map = self.tunnels.write().await;
            map.drain().map(|(_, v)| v).collect()
        };
        let count = tunnels.len();
        let closes = tunnels.into_iter().map(|t| async move { t.close().await });
        futures_join_all(closes).await;
        count
    }

    /// Lists every live tunnel, opportunistically pruning entries whose
    /// tunnel has already transitioned to Closed (e.g. after a failed
    /// reconnect) before building the snapshot.
    pub async fn list(&self) -> Vec<TunnelView> {
        {
            let mut map = self.tunnels.write().await;
            map.retain(|_, t| !t.is_closed());
        }

        let map = self.tunnels.read().await;
        let mut views: Vec<TunnelView> = map.values().map(|t| t.view()).collect();
        views.sort_by(|a, b| (a.host.as_str(), a.remote_port).cmp(&(b.host.as_str(), b.remote_port)));
        views
    }
}

/// Minimal stand-in for `futures::future::join_all` so the dependency
/// surface stays exactly what the rest of the daemon already needs.
async fn futures_join_all(iter: impl IntoIterator<Item = impl std::future::Future<Output = ()>>) {
    let handles: Vec<_> = iter.into_iter().map(tokio::spawn).collect();
    for h in handles {
        let _ = h.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_credentials() -> SshCredentials {
        SshCredentials {
            user: "deploy".to_string(),
            key_path: std::path::PathBuf::from("/dev/null"),
            key_passphrase: None,
            connect_timeout_secs: 5,
            handshake_timeout_secs: 5,
            keepalive_interval_secs: 10,
        }
    }

    #[tokio::test]
    async fn closing_an_unknown_tunnel_reports_not_found() {
        let registry = Registry::new(sample_credentials(), ConnectionLimits::default());
        let err = registry.close("nowhere.example", 5432).await.unwrap_err();
        assert!(matches!(err, DaemonError::NotFound { .. }));
    }

    #[tokio::test]
    async fn listing_an_empty_registry_returns_no_tunnels() {
        let registry = Registry::new(sample_credentials(), ConnectionLimits::default());
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn close_all_on_empty_registry_reports_zero() {
        let registry = Registry::new(sample_credentials(), ConnectionLimits::default());
        assert_eq!(registry.close_all().await, 0);
    }

    #[test]
    fn tunnel_key_equality_is_by_host_and_remote_port() {
        let a = TunnelKey {
            host: "example.com".to_string(),
            remote_port: 5432,
        };
        let b = TunnelKey {
            host: "example.com".to_string(),
            remote_port: 5432,
        };
        assert_eq!(a, b);
    }
}
