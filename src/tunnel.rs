//! Tunnel: the state machine owning one SSH Session, its listener(s), and
//! the Forwarding Sessions dialed against it. Handles accept, periodic
//! health checks, and reconnection.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::Mutex as SyncMutex;
use tokio::net::TcpListener;
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::SshCredentials;
use crate::error::{DaemonError, DaemonResult};
use crate::forwarding::{self, SessionSource};
use crate::meter::{ActivityMeter, MeterView};
use crate::ssh_session::SshSession;

const HEALTH_TICK: Duration = Duration::from_secs(15);
const PROBE_DEADLINE: Duration = Duration::from_secs(5);
const KEEPALIVE_TICK: Duration = Duration::from_secs(10);
const RECONNECT_GRACE: Duration = Duration::from_secs(30);
const ACCEPT_ERROR_LIMIT: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelKey {
    pub host: String,
    pub remote_port: u16,
}

#[derive(Debug, Clone)]
pub struct TunnelSpec {
    pub host: String,
    pub local_port: u16,
    pub remote_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Starting,
    Running,
    Reconnecting,
    Draining,
    Closed,
}

/// Tracks connection attempts per host within a sliding window, rejecting
/// bursts that would otherwise hammer an unreachable or misconfigured host.
#[derive(Debug)]
pub struct ConnectionLimiter {
    attempts: HashMap<String, (u32, Instant)>,
    max_attempts: u32,
    window: Duration,
}

impl ConnectionLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            attempts: HashMap::new(),
            max_attempts,
            window,
        }
    }

    pub fn can_attempt(&mut self, host: &str) -> bool {
        let now = Instant::now();
        self.attempts.retain(|_, (_, time)| now.duration_since(*time) < self.window);

        match self.attempts.get_mut(host) {
            Some((count, time)) => {
                if now.duration_since(*time) >= self.window {
                    *count = 1;
                    *time = now;
                    true
                } else if *count >= self.max_attempts {
                    false
                } else {
                    *count += 1;
                    true
                }
            }
            None => {
                self.attempts.insert(host.to_string(), (1, now));
                true
            }
        }
    }
}

/// One or two loopback listeners (IPv4 and, when available, IPv6) accepted
/// from as a single logical stream.
struct LoopbackListeners(Vec<TcpListener>);

impl LoopbackListeners {
    async fn bind(local_port: u16) -> DaemonResult<Self> {
        let mut listeners = Vec::with_capacity(2);
        let v4 = TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local_port)).await;
        if let Ok(l) = v4 {
            listeners.push(l);
        }
        let v6 = TcpListener::bind(SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), local_port)).await;
        if let Ok(l) = v6 {
            listeners.push(l);
        }
        if listeners.is_empty() {
            return Err(DaemonError::Ssh(format!(
                "failed to bind loopback listener on port {local_port}"
            )));
        }
        Ok(Self(listeners))
    }

    async fn accept(&self) -> std::io::Result<(tokio::net::TcpStream, SocketAddr)> {
        match self.0.len() {
            1 => self.0[0].accept().await,
            _ => {
                tokio::select! {
                    res = self.0[0].accept() => res,
                    res = self.0[1].accept() => res,
                }
            }
        }
    }
}

pub struct Tunnel {
    spec: TunnelSpec,
    credentials: SshCredentials,
    limiter: Arc<SyncMutex<ConnectionLimiter>>,
    ssh: RwLock<Arc<SshSession>>,
    listeners: LoopbackListeners,
    meter: Arc<ActivityMeter>,
    state: SyncMutex<TunnelState>,
    cancel: CancellationToken,
    reconnect_request: Notify,
    reconnect_done: Notify,
    closed: AtomicBool,
}

impl Tunnel {
    /// Dials the remote host and binds the local listener(s). All the
    /// expensive I/O happens here, before the tunnel is handed to a
    /// Registry, so the registry's own lock is only ever held for a quick
    /// map insert.
    pub async fn create(
        spec: TunnelSpec,
        credentials: SshCredentials,
        limiter: Arc<SyncMutex<ConnectionLimiter>>,
    ) -> DaemonResult<Arc<Self>> {
        if !limiter.lock().can_attempt(&spec.host) {
            return Err(DaemonError::RateLimited(spec.host.clone()));
        }

        let ssh = SshSession::connect(&spec.host, &credentials).await?;
        let listeners = LoopbackListeners::bind(spec.local_port).await?;

        info!(
            "tunnel up: {}:{} -> local:{}",
            spec.host, spec.remote_port, spec.local_port
        );

        Ok(Arc::new(Self {
            spec,
            credentials,
            limiter,
            ssh: RwLock::new(Arc::new(ssh)),
            listeners,
            meter: Arc::new(ActivityMeter::new()),
            state: SyncMutex::new(TunnelState::Starting),
            cancel: CancellationToken::new(),
            reconnect_request: Notify::new(),
            reconnect_done: Notify::new(),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn key(&self) -> TunnelKey {
        TunnelKey {
            host: self.spec.host.clone(),
            remote_port: self.spec.remote_port,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn view(&self) -> TunnelView {
        let snap = self.meter.snapshot();
        TunnelView {
            host: self.spec.host.clone(),
            local_port: self.spec.local_port,
            remote_port: self.spec.remote_port,
            meter: snap,
        }
    }

    /// Spawns the accept loop, the keepalive loop, the health loop, and the
    /// reconnect controller. Consumes no resources until called.
    pub fn start(self: &Arc<Self>) {
        self.set_state(TunnelState::Running);
        tokio::spawn(Arc::clone(self).accept_loop());
        tokio::spawn(Arc::clone(self).keepalive_loop());
        tokio::spawn(Arc::clone(self).health_loop());
        tokio::spawn(Arc::clone(self).reconnect_loop());
    }

    fn set_state(&self, state: TunnelState) {
        *self.state.lock() = state;
    }

    pub fn state(&self) -> TunnelState {
        *self.state.lock()
    }

    /// Transient accept errors (the common case — e.g. a connection reset
    /// before the kernel handed it off) are logged and retried immediately.
    /// A run of consecutive failures is treated as a permanent condition
    /// (the listener itself is no longer usable) and drains the tunnel
    /// instead of spinning forever.
    async fn accept_loop(self: Arc<Self>) {
        let mut consecutive_errors = 0u32;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listeners.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            consecutive_errors = 0;
                            debug!("accepted local connection {addr} for remote port {}", self.spec.remote_port);
                            let this = Arc::clone(&self);
                            let meter = Arc::clone(&self.meter);
                            let cancel = self.cancel.clone();
                            tokio::spawn(async move {
                                let source: Arc<dyn SessionSource> = this.clone();
                                forwarding::run(stream, this.spec.remote_port, source, meter, cancel).await;
                            });
                        }
                        Err(e) => {
                            consecutive_errors += 1;
                            if consecutive_errors >= ACCEPT_ERROR_LIMIT {
                                warn!(
                                    "accept failed {consecutive_errors} times in a row on tunnel {}:{}, draining: {e}",
                                    self.spec.host, self.spec.remote_port
                                );
                                self.close().await;
                                break;
                            }
                            debug!("accept failed on tunnel {}:{}: {e}", self.spec.host, self.spec.remote_port);
                        }
                    }
                }
            }
        }
    }

    /// Unconditional keepalive every 10s, independent of the health loop's
    /// idle-gated probing. A failure here marks the session dead and wakes
    /// the reconnect controller.
    async fn keepalive_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(KEEPALIVE_TICK);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let ssh = self.ssh.read().await.clone();
                    if ssh.probe(Duration::from_secs(5)).await.is_err() {
                        self.request_reconnect();
                    }
                }
            }
        }
    }

    /// Probes the session only when idle (active_conns == 0), per the
    /// health policy: a busy tunnel is already proving its own liveness.
    async fn health_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(HEALTH_TICK);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.meter.active_conns() > 0 {
                        continue;
                    }
                    let ssh = self.ssh.read().await.clone();
                    if ssh.probe(PROBE_DEADLINE).await.is_err() {
                        self.request_reconnect();
                    }
                }
            }
        }
    }

    /// Serialized reconnect controller: coalesces repeated wake-ups (only
    /// one reconnect runs at a time) and swaps in a fresh session on
    /// success, or closes the tunnel on failure.
    async fn reconnect_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.reconnect_request.notified() => {
                    if self.is_closed() {
                        break;
                    }
                    if !self.limiter.lock().can_attempt(&self.spec.host) {
                        debug!(
                            "reconnect for {}:{} rate limited, skipping this tick",
                            self.spec.host, self.spec.remote_port
                        );
                        continue;
                    }
                    self.set_state(TunnelState::Reconnecting);
                    match SshSession::connect(&self.spec.host, &self.credentials).await {
                        Ok(fresh) => {
                            let old = {
                                let mut guard = self.ssh.write().await;
                                std::mem::replace(&mut *guard, Arc::new(fresh))
                            };
                            self.set_state(TunnelState::Running);
                            self.reconnect_done.notify_waiters();
                            info!("reconnected tunnel {}:{}", self.spec.host, self.spec.remote_port);
                            tokio::spawn(async move {
                                tokio::time::sleep(RECONNECT_GRACE).await;
                                old.close().await;
                            });
                        }
                        Err(e) => {
                            warn!(
                                "reconnect failed for {}:{}: {e}, closing tunnel",
                                self.spec.host, self.spec.remote_port
                            );
                            self.close().await;
                            break;
                        }
                    }
                }
            }
        }
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(TunnelState::Draining);
        self.cancel.cancel();
        let ssh = self.ssh.read().await.clone();
        ssh.close().await;
        self.set_state(TunnelState::Closed);
    }
}

#[async_trait::async_trait]
impl SessionSource for Tunnel {
    async fn current_ssh(&self) -> Arc<SshSession> {
        self.ssh.read().await.clone()
    }

    fn request_reconnect(&self) {
        self.reconnect_request.notify_one();
    }

    async fn wait_for_fresh_session(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.reconnect_done.notified())
            .await
            .is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct TunnelView {
    pub host: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub meter: MeterView,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_limiter_rejects_bursts_and_resets_after_window() {
        let mut limiter = ConnectionLimiter::new(2, Duration::from_millis(50));
        assert!(limiter.can_attempt("example.com"));
        assert!(limiter.can_attempt("example.com"));
        assert!(!limiter.can_attempt("example.com"));

        std::thread::sleep(Duration::from_millis(60));
        assert!(limiter.can_attempt("example.com"));
    }

    #[test]
    fn connection_limiter_tracks_hosts_independently() {
        let mut limiter = ConnectionLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.can_attempt("a.example.com"));
        assert!(limiter.can_attempt("b.example.com"));
        assert!(!limiter.can_attempt("a.example.com"));
    }
}
