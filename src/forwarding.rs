//! Forwarding Session: the lifecycle of a single accepted local connection,
//! from dialing the matching remote channel through to the bidirectional
//! pump and its eventual, orderly teardown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::error::{classify, DaemonError, DaemonResult, ErrorClass};
use crate::meter::ActivityMeter;
use crate::ssh_session::{SshChannel, SshSession};

const LOCAL_KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);
const SETUP_DEADLINE: Duration = Duration::from_secs(30);
const DIAL_OVERALL_DEADLINE: Duration = Duration::from_secs(10);
const DIAL_ATTEMPTS: usize = 3;
const DIAL_BACKOFFS: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(2)];
const PUMP_READ_DEADLINE: Duration = Duration::from_secs(5);
const PUMP_WRITE_DEADLINE: Duration = Duration::from_secs(5);
const SESSION_CAP: Duration = Duration::from_secs(12 * 3600);
const BUFFER_SIZE: usize = 32 * 1024;

/// Narrow view of a Tunnel that a Forwarding Session needs: the current SSH
/// Session, a way to ask for a reconnect, and a signal fired when a fresh
/// one lands.
#[async_trait::async_trait]
pub trait SessionSource: Send + Sync {
    async fn current_ssh(&self) -> Arc<SshSession>;
    fn request_reconnect(&self);
    async fn wait_for_fresh_session(&self, timeout: Duration) -> bool;
}

/// Drives one accepted local connection end to end. Bumps the meter's
/// `active_conns`/`total_conns` for the duration and always releases it on
/// the way out, including on setup failure.
pub async fn run(
    local: TcpStream,
    remote_port: u16,
    source: Arc<dyn SessionSource>,
    meter: Arc<ActivityMeter>,
    cancel: CancellationToken,
) {
    meter.session_began();
    let _guard = SessionGuard(Arc::clone(&meter));

    let setup_deadline = Instant::now() + SETUP_DEADLINE;
    let dial = tokio::time::timeout(
        SETUP_DEADLINE,
        dial_with_retries(remote_port, &source, setup_deadline),
    )
    .await;

    let channel = match dial {
        Ok(Ok(channel)) => channel,
        Ok(Err(e)) => {
            warn!("forwarding setup to remote port {remote_port} failed: {e}");
            return;
        }
        Err(_) => {
            warn!("forwarding setup to remote port {remote_port} timed out after {SETUP_DEADLINE:?}");
            return;
        }
    };

    if let Err(e) = apply_local_keepalive(&local) {
        debug!("failed to set local socket keepalive for remote port {remote_port}: {e}");
    }

    pump(local, channel, source, meter, cancel).await;
}

/// OS keepalive on the accepted local connection, mirroring the keepalive
/// already carried by the SSH transport's own socket. Best-effort: a
/// failure here is logged, not fatal to the session.
fn apply_local_keepalive(local: &TcpStream) -> DaemonResult<()> {
    let sock = socket2::SockRef::from(local);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(LOCAL_KEEPALIVE_PERIOD)
        .with_interval(LOCAL_KEEPALIVE_PERIOD);
    sock.set_tcp_keepalive(&keepalive).map_err(DaemonError::Io)
}

/// Ensures `session_ended` fires exactly once, even if `run` returns early.
struct SessionGuard(Arc<ActivityMeter>);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.session_ended();
    }
}

async fn dial_with_retries(
    remote_port: u16,
    source: &Arc<dyn SessionSource>,
    setup_deadline: Instant,
) -> DaemonResult<SshChannel> {
    let overall_deadline = (Instant::now() + DIAL_OVERALL_DEADLINE).min(setup_deadline);
    let mut last_err = None;

    for attempt in 0..DIAL_ATTEMPTS {
        if attempt > 0 {
            let ssh = source.current_ssh().await;
            if ssh.is_dead() {
                source.request_reconnect();
                source.wait_for_fresh_session(Duration::from_secs(10)).await;
            }
            tokio::time::sleep(DIAL_BACKOFFS[attempt - 1]).await;
        }

        if Instant::now() >= overall_deadline {
            break;
        }

        let ssh = source.current_ssh().await;
        let per_attempt_deadline = overall_deadline.min(Instant::now() + Duration::from_secs(5));
        match ssh.dial_remote(remote_port, per_attempt_deadline).await {
            Ok(channel) => return Ok(channel),
            Err(e) => {
                debug!("dial attempt {} to remote port {remote_port} failed: {e}", attempt + 1);
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or(DaemonError::Timeout))
}

async fn pump(
    local: TcpStream,
    channel: SshChannel,
    source: Arc<dyn SessionSource>,
    meter: Arc<ActivityMeter>,
    parent_cancel: CancellationToken,
) {
    let (mut local_rx, mut local_tx) = local.into_split();
    let session_cancel = parent_cancel.child_token();
    let channel = Arc::new(channel);

    let up = {
        let cancel = session_cancel.clone();
        let channel = Arc::clone(&channel);
        let source = Arc::clone(&source);
        let meter = Arc::clone(&meter);
        async move {
            let mut buf = vec![0u8; BUFFER_SIZE];
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let read = tokio::time::timeout(PUMP_READ_DEADLINE, local_rx.read(&mut buf)).await;
                match read {
                    Err(_elapsed) => continue,
                    Ok(Ok(0)) => break,
                    Ok(Ok(n)) => {
                        let ssh = source.current_ssh().await;
                        let deadline = Instant::now() + PUMP_WRITE_DEADLINE;
                        match ssh.write_channel(&channel, &buf[..n], deadline).await {
                            Ok(()) => meter.record_bytes_sent(n as u64),
                            Err(e) => {
                                debug!("local->remote write stopped: {e}");
                                break;
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        match classify(&e) {
                            ErrorClass::Benign => {}
                            ErrorClass::Timeout => continue,
                            ErrorClass::Fatal => warn!("local->remote read error: {e}"),
                        }
                        break;
                    }
                }
            }
            cancel.cancel();
        }
    };

    let down = {
        let cancel = session_cancel.clone();
        let channel = Arc::clone(&channel);
        let source = Arc::clone(&source);
        let meter = Arc::clone(&meter);
        async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let ssh = source.current_ssh().await;
                let deadline = Instant::now() + PUMP_READ_DEADLINE;
                match ssh.read_channel(&channel, BUFFER_SIZE, deadline).await {
                    Ok(data) if data.is_empty() => break,
                    Ok(data) => {
                        if let Err(e) = local_tx.write_all(&data).await {
                            if classify(&e) == ErrorClass::Fatal {
                                warn!("remote->local write error: {e}");
                            }
                            break;
                        }
                        meter.record_bytes_received(data.len() as u64);
                    }
                    Err(DaemonError::Timeout) => continue,
                    Err(e) => {
                        debug!("remote->local read stopped: {e}");
                        break;
                    }
                }
            }
            cancel.cancel();
        }
    };

    let capped = tokio::time::timeout(SESSION_CAP, async {
        tokio::join!(up, down);
    });

    if capped.await.is_err() {
        debug!("forwarding session hit its lifetime cap, tearing down");
        session_cancel.cancel();
    }
}
