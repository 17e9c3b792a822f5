//! Configuration loading and persistence.
//!
//! Holds the connection parameters, enabled-streams map, SSL flag, log
//! level, and (server role only) the authorized-clients allowlist described
//! in spec §6 "Persisted state". Unlike the teacher's plain `fs::write`,
//! saves here are atomic: write to a sibling temp file, then rename.

use std::collections::HashMap;
use std::{fs, io, path::PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_CERT_SHARE_PORT, DEFAULT_SERVER_PORT};
use crate::protocol::message::{ScreenPosition, StreamKind};

/// An entry in the server's authorized-clients allowlist.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AuthorizedClient {
    /// Declared hostname, matched with precedence `hostname > ip_address > uid`.
    pub hostname: Option<String>,
    /// Last known IP address, used as a fallback identity key.
    pub ip_address: Option<String>,
    /// Stable UID, used as the identity key of last resort.
    pub uid: String,
    /// The screen position this client occupies when connected.
    pub screen_position: ScreenPosition,
}

/// Fabric configuration, persisted per role under the config directory.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FabricConfig {
    /// Host to bind (server) or dial (client).
    pub host: String,
    /// Primary port carrying the `Command` stream.
    pub port: u16,
    /// Certificate-sharing port (§4.6).
    pub cert_share_port: u16,
    /// Which stream kinds are enabled beyond the mandatory `Command`.
    pub streams_enabled: Vec<StreamKind>,
    /// Whether additional streams should be upgraded to TLS after connect.
    pub ssl: bool,
    /// `log` crate filter string, e.g. `"info"` or `"inputfabric=debug"`.
    pub log_level: String,
    /// Server-only: allowlist of clients permitted to complete a handshake.
    /// Empty on the client role.
    #[serde(default)]
    pub authorized_clients: Vec<AuthorizedClient>,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_SERVER_PORT,
            cert_share_port: DEFAULT_CERT_SHARE_PORT,
            streams_enabled: vec![StreamKind::Mouse, StreamKind::Keyboard, StreamKind::Clipboard],
            ssl: true,
            log_level: "info".to_string(),
            authorized_clients: Vec::new(),
        }
    }
}

impl FabricConfig {
    /// Returns the configuration directory, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `INPUTFABRIC_CONFIG_DIR` env var: explicit override.
    /// 2. `#[cfg(test)]` or `INPUTFABRIC_ENV=test`: a repo-local `tmp/` dir.
    /// 3. Default: platform config dir via `dirs::config_dir()`.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(over) = std::env::var("INPUTFABRIC_CONFIG_DIR") {
            PathBuf::from(over)
        } else if cfg!(test) || std::env::var("INPUTFABRIC_ENV").as_deref() == Ok("test") {
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/inputfabric-test")
        } else {
            dirs::config_dir()
                .context("could not determine platform config directory")?
                .join("inputfabric")
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn path_for(role: &str) -> Result<PathBuf> {
        Ok(Self::config_dir()?.join(format!("{role}.json")))
    }

    /// Load the configuration for a role (`"server"` or `"client"`), falling
    /// back to defaults if no file exists yet.
    pub fn load(role: &str) -> Result<Self> {
        let path = Self::path_for(role)?;
        let mut config = if !path.exists() {
            Self::default()
        } else {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read config at {}", path.display()))?;
            serde_json::from_str(&content).context("failed to parse config JSON")?
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Overrides loaded from `INPUTFABRIC_*` env vars, checked after the
    /// config file so callers can tweak a single field without editing JSON.
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("INPUTFABRIC_HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("INPUTFABRIC_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.port = port;
            }
        }
        if let Ok(cert_share_port) = std::env::var("INPUTFABRIC_CERT_SHARE_PORT") {
            if let Ok(port) = cert_share_port.parse::<u16>() {
                self.cert_share_port = port;
            }
        }
        if let Ok(ssl) = std::env::var("INPUTFABRIC_SSL") {
            if let Ok(ssl) = ssl.parse::<bool>() {
                self.ssl = ssl;
            }
        }
        if let Ok(log_level) = std::env::var("INPUTFABRIC_LOG_LEVEL") {
            self.log_level = log_level;
        }
    }

    /// Persist the configuration for a role atomically: write to a sibling
    /// `.tmp` file, then rename over the target path.
    pub fn save(&self, role: &str) -> Result<()> {
        let path = Self::path_for(role)?;
        let tmp_path = path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(self)?;

        fs::write(&tmp_path, &body)
            .with_context(|| format!("failed to write temp config at {}", tmp_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
        }

        fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename config into place at {}", path.display()))?;
        Ok(())
    }

    /// Look up an authorized client by the identity-precedence rule
    /// (`hostname > ip_address > uid`) used across reconnects.
    pub fn find_authorized(&self, hostname: Option<&str>, ip: Option<&str>, uid: &str) -> Option<&AuthorizedClient> {
        if let Some(h) = hostname {
            if let Some(found) = self
                .authorized_clients
                .iter()
                .find(|c| c.hostname.as_deref() == Some(h))
            {
                return Some(found);
            }
        }
        if let Some(ip) = ip {
            if let Some(found) = self
                .authorized_clients
                .iter()
                .find(|c| c.ip_address.as_deref() == Some(ip))
            {
                return Some(found);
            }
        }
        self.authorized_clients.iter().find(|c| c.uid == uid)
    }
}

/// Maps `ScreenPosition` to the authorized client occupying it, enforcing
/// the uniqueness invariant at the config layer (one entry per non-center
/// position). Used by callers assembling a server config interactively.
pub fn positions_in_use(clients: &[AuthorizedClient]) -> HashMap<ScreenPosition, &AuthorizedClient> {
    let mut map = HashMap::new();
    for client in clients {
        if client.screen_position != ScreenPosition::Center && client.screen_position != ScreenPosition::None {
            map.entry(client.screen_position).or_insert(client);
        }
    }
    map
}

/// Atomically overwrite an arbitrary file's contents (used by `cert_share`
/// to persist a received CA). Exposed alongside `FabricConfig::save` since
/// both need the same temp-file-then-rename discipline.
pub fn atomic_write(path: &std::path::Path, contents: &[u8]) -> io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, contents)?;
    fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_mandatory_command_stream_implicit() {
        let config = FabricConfig::default();
        assert_eq!(config.port, DEFAULT_SERVER_PORT);
        assert!(config.ssl);
        assert!(config.authorized_clients.is_empty());
    }

    #[test]
    fn save_and_load_roundtrip() {
        std::env::set_var("INPUTFABRIC_CONFIG_DIR", std::env::temp_dir().join(format!(
            "inputfabric-cfg-test-{}", uuid::Uuid::new_v4()
        )));
        let mut config = FabricConfig::default();
        config.authorized_clients.push(AuthorizedClient {
            hostname: Some("alpha".into()),
            ip_address: None,
            uid: "uid-1".into(),
            screen_position: ScreenPosition::Top,
        });
        config.save("server").unwrap();

        let loaded = FabricConfig::load("server").unwrap();
        assert_eq!(loaded.authorized_clients.len(), 1);
        assert_eq!(loaded.authorized_clients[0].hostname.as_deref(), Some("alpha"));
        std::env::remove_var("INPUTFABRIC_CONFIG_DIR");
    }

    #[test]
    fn find_authorized_prefers_hostname_over_ip_and_uid() {
        let config = FabricConfig {
            authorized_clients: vec![
                AuthorizedClient {
                    hostname: Some("alpha".into()),
                    ip_address: Some("10.0.0.1".into()),
                    uid: "uid-1".into(),
                    screen_position: ScreenPosition::Top,
                },
                AuthorizedClient {
                    hostname: None,
                    ip_address: Some("10.0.0.2".into()),
                    uid: "uid-2".into(),
                    screen_position: ScreenPosition::Left,
                },
            ],
            ..FabricConfig::default()
        };

        let found = config.find_authorized(Some("alpha"), Some("10.0.0.2"), "uid-2").unwrap();
        assert_eq!(found.uid, "uid-1");

        let found = config.find_authorized(None, Some("10.0.0.2"), "uid-x").unwrap();
        assert_eq!(found.uid, "uid-2");

        let found = config.find_authorized(None, None, "uid-2").unwrap();
        assert_eq!(found.uid, "uid-2");

        assert!(config.find_authorized(None, None, "unknown").is_none());
    }

    #[test]
    fn positions_in_use_ignores_center_and_none() {
        let clients = vec![
            AuthorizedClient {
                hostname: None,
                ip_address: None,
                uid: "a".into(),
                screen_position: ScreenPosition::Center,
            },
            AuthorizedClient {
                hostname: None,
                ip_address: None,
                uid: "b".into(),
                screen_position: ScreenPosition::Left,
            },
        ];
        let map = positions_in_use(&clients);
        assert_eq!(map.len(), 1);
        assert!(map.contains_key(&ScreenPosition::Left));
    }
}
