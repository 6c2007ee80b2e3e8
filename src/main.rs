use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use tunnel_daemon::config::DaemonConfig;
use tunnel_daemon::registry::Registry;
use tunnel_daemon::rpc;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.contains(&"--help".to_string()) || args.contains(&"-h".to_string()) {
        print_help();
        return Ok(());
    }

    env_logger::init();

    info!("Starting tunneld v{}", env!("CARGO_PKG_VERSION"));

    let config = DaemonConfig::load().context("failed to load configuration")?;
    info!(
        "SSH identity: {}@* (key: {})",
        config.ssh.user,
        config.ssh.key_path.display()
    );
    info!("control socket: {}", config.socket_path.display());

    let registry = Arc::new(Registry::new(config.ssh.clone(), config.limits.clone()));
    let shutdown = CancellationToken::new();

    let rpc_handle = {
        let registry = Arc::clone(&registry);
        let shutdown = shutdown.clone();
        let socket_path = config.socket_path.clone();
        tokio::spawn(async move { rpc::serve(&socket_path, registry, shutdown).await })
    };

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        result = rpc_handle => {
            match result {
                Ok(Ok(())) => info!("RPC facade exited"),
                Ok(Err(e)) => log::error!("RPC facade failed: {e}"),
                Err(e) => log::error!("RPC facade task panicked: {e}"),
            }
        }
    }

    shutdown.cancel();
    let closed = registry.close_all().await;
    info!("closed {closed} tunnel(s) during shutdown");

    Ok(())
}

fn print_help() {
    println!("tunneld v{}", env!("CARGO_PKG_VERSION"));
    println!("A daemon that multiplexes outbound SSH tunnels behind a local RPC control socket");
    println!();
    println!("USAGE:");
    println!("    tunneld [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help          Print this help information");
    println!();
    println!("ENVIRONMENT VARIABLES:");
    println!("    SSH_USER              SSH username (defaults to the invoking OS user)");
    println!("    SSH_KEY_PATH          Path to the private key used to authenticate");
    println!("    SSH_KEY_PASSPHRASE    Passphrase for the private key, if any");
    println!("    TUNNEL_SOCKET_PATH    Path of the RPC control socket (default /tmp/tunnel.sock)");
    println!();
    println!("Tunnels are not configured statically: create and close them over the");
    println!("control socket with CreateTunnel/CloseTunnel/CloseAllTunnels/ListTunnels requests.");
}
