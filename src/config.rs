//! Ambient daemon configuration: SSH credentials, the control-socket path,
//! and connection limits. Tunnels themselves are not configured here — they
//! are created dynamically over the RPC control plane (see `rpc`).
//!
//! Loading follows the teacher's TOML-first-then-environment shape
//! (`Config::load()` trying `load_toml()` before `load_legacy()`), but the
//! legacy path here only ever supplies credentials, never a tunnel list.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf};

use crate::security::SecureKeyManager;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub ssh: SshCredentials,
    pub socket_path: PathBuf,
    pub limits: ConnectionLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshCredentials {
    pub user: String,
    pub key_path: PathBuf,
    pub key_passphrase: Option<String>,
    pub connect_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionLimits {
    pub max_attempts: u32,
    pub retry_window_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_window_secs: 300,
            max_backoff_secs: 60,
        }
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/tmp/tunnel.sock")
}

impl DaemonConfig {
    pub fn load() -> Result<Self> {
        if let Ok(config) = Self::load_toml() {
            return Ok(config);
        }

        Self::load_env()
    }

    fn load_toml() -> Result<Self> {
        let config_paths = ["/etc/tunnel-daemon/tunneld.toml", "./tunneld.toml"];

        for path in &config_paths {
            if let Ok(content) = fs::read_to_string(path) {
                let mut config: DaemonConfig =
                    toml::from_str(&content).context("failed to parse TOML configuration")?;
                config.ssh.key_path = resolve_key_path(&config.ssh.key_path)?;
                SecureKeyManager::validate_key_security(&config.ssh.key_path)
                    .context("SSH key security validation failed")?;
                return Ok(config);
            }
        }

        Err(anyhow!("no TOML config found"))
    }

    /// Discovers SSH credentials: `SSH_KEY_PATH`, then well-known `.ssh`
    /// filenames.
    fn load_env() -> Result<Self> {
        let env_path = if PathBuf::from("/etc/tunnel-daemon/.env").exists() {
            "/etc/tunnel-daemon/.env"
        } else {
            ".env"
        };
        // Optional: a missing .env is not an error, environment may already
        // be populated by the caller (systemd, shell, etc).
        let _ = dotenvy::from_path(env_path);

        let user = env::var("SSH_USER").unwrap_or_else(|_| whoami_fallback());
        let key_path = discover_ssh_key()?;
        let key_passphrase = env::var("SSH_KEY_PASSPHRASE").ok();

        SecureKeyManager::validate_key_security(&key_path)
            .context("SSH key security validation failed")?;

        Ok(DaemonConfig {
            ssh: SshCredentials {
                user,
                key_path,
                key_passphrase,
                connect_timeout_secs: 30,
                handshake_timeout_secs: 30,
                keepalive_interval_secs: 10,
            },
            socket_path: env::var("TUNNEL_SOCKET_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_socket_path()),
            limits: ConnectionLimits::default(),
        })
    }
}

fn resolve_key_path(raw: &PathBuf) -> Result<PathBuf> {
    if raw.is_absolute() && raw.exists() {
        return raw.canonicalize().context("failed to canonicalize SSH key path");
    }
    discover_ssh_key()
}

/// `SSH_KEY_PATH` env var, then `~/.ssh/{id_ed25519,id_rsa,id_ecdsa}` in
/// that order.
fn discover_ssh_key() -> Result<PathBuf> {
    if let Ok(raw) = env::var("SSH_KEY_PATH") {
        let path = PathBuf::from(raw);
        if path.exists() {
            return path.canonicalize().context("failed to canonicalize SSH_KEY_PATH");
        }
        return Err(anyhow!(
            "SSH_KEY_PATH set to {} but the file does not exist",
            path.display()
        ));
    }

    let home = env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("could not determine home directory"))?;
    let ssh_dir = home.join(".ssh");
    for candidate in ["id_ed25519", "id_rsa", "id_ecdsa"] {
        let path = ssh_dir.join(candidate);
        if path.exists() {
            return path.canonicalize().context("failed to canonicalize discovered SSH key");
        }
    }

    Err(anyhow!(
        "no SSH key found: set SSH_KEY_PATH or place one of id_ed25519/id_rsa/id_ecdsa in {}",
        ssh_dir.display()
    ))
}

fn whoami_fallback() -> String {
    env::var("USER")
        .or_else(|_| env::var("LOGNAME"))
        .unwrap_or_else(|_| "root".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_limits_default_matches_teacher_shape() {
        let limits = ConnectionLimits::default();
        assert_eq!(limits.max_attempts, 5);
        assert_eq!(limits.retry_window_secs, 300);
        assert_eq!(limits.max_backoff_secs, 60);
    }

    #[test]
    fn daemon_config_round_trips_through_toml() {
        let config = DaemonConfig {
            ssh: SshCredentials {
                user: "testuser".to_string(),
                key_path: PathBuf::from("/home/user/.ssh/id_ed25519"),
                key_passphrase: None,
                connect_timeout_secs: 30,
                handshake_timeout_secs: 30,
                keepalive_interval_secs: 10,
            },
            socket_path: PathBuf::from("/tmp/tunnel.sock"),
            limits: ConnectionLimits::default(),
        };

        let serialized = toml::to_string(&config).unwrap();
        let deserialized: DaemonConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(deserialized.ssh.user, "testuser");
        assert_eq!(deserialized.socket_path, PathBuf::from("/tmp/tunnel.sock"));
    }
}
