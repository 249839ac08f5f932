//! Gateway configuration (`gateway-config.json`).
//!
//! One file per data root lists the identities to host, the P2P port,
//! per-identity ACLs and wake flags, and the optional WebSocket
//! bridge. Config errors at startup abort the daemon with a clear
//! message.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use clawchat_types::{ClawchatError, Principal, Result};

/// The config schema version this build reads and writes.
pub const CONFIG_VERSION: u32 = 1;

/// Default P2P listen port.
pub const DEFAULT_P2P_PORT: u16 = 4470;

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Top-level `gateway-config.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Schema version; must be [`CONFIG_VERSION`].
    pub version: u32,
    /// TCP port the transport listens on. `0` binds an ephemeral port.
    #[serde(default = "default_p2p_port")]
    pub p2p_port: u16,
    /// Optional WebSocket bridge settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_bridge: Option<WsBridgeConfig>,
    /// External wake hook program; also settable via `CLAWCHAT_WAKE_HOOK`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wake_hook: Option<String>,
    /// Identities this gateway hosts.
    #[serde(default)]
    pub identities: Vec<IdentityConfig>,
}

/// WebSocket bridge block.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsBridgeConfig {
    /// TCP port for browser clients.
    pub port: u16,
    /// Shared auth token. Empty or absent auto-authenticates clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Optional static file directory served next to the WS endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_dir: Option<String>,
}

/// One hosted identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityConfig {
    /// The identity's principal; its files live under
    /// `identities/<principal>/`.
    pub principal: Principal,
    /// Display nick, resolvable in `--as` selectors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nick: Option<String>,
    /// Load this identity at daemon startup. The first autoloaded
    /// entry is the default identity.
    #[serde(default = "default_true")]
    pub autoload: bool,
    /// Admit any `local:` remote sender in addition to the allow-list.
    #[serde(default)]
    pub allow_local: bool,
    /// Inbound ACL: principals allowed to deliver, or the `"*"`
    /// wildcard.
    #[serde(default)]
    pub allowed_remote_peers: Vec<String>,
    /// Invoke the wake hook on inbound deliveries.
    #[serde(default)]
    pub openclaw_wake: bool,
}

fn default_true() -> bool {
    true
}

fn default_p2p_port() -> u16 {
    DEFAULT_P2P_PORT
}

// ---------------------------------------------------------------------------
// Load / save / validate
// ---------------------------------------------------------------------------

impl GatewayConfig {
    /// A fresh config with no identities.
    pub fn new(p2p_port: u16) -> Self {
        Self {
            version: CONFIG_VERSION,
            p2p_port,
            ws_bridge: None,
            wake_hook: None,
            identities: Vec::new(),
        }
    }

    /// Reads and validates a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ClawchatError::Config {
            reason: format!("failed to read '{}': {e}", path.display()),
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| ClawchatError::Config {
            reason: format!("invalid config '{}': {e}", path.display()),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the config, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ClawchatError::Storage {
                reason: format!("failed to create '{}': {e}", parent.display()),
            })?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| ClawchatError::Config {
            reason: format!("failed to serialize config: {e}"),
        })?;
        std::fs::write(path, json).map_err(|e| ClawchatError::Storage {
            reason: format!("failed to write '{}': {e}", path.display()),
        })
    }

    /// Structural validation: version, principal shapes, nick
    /// uniqueness across autoloaded identities.
    pub fn validate(&self) -> Result<()> {
        if self.version != CONFIG_VERSION {
            return Err(ClawchatError::Config {
                reason: format!(
                    "unsupported config version {} (expected {CONFIG_VERSION})",
                    self.version
                ),
            });
        }

        let mut seen_principals = HashSet::new();
        let mut seen_nicks = HashSet::new();
        for entry in &self.identities {
            Principal::parse(entry.principal.as_str())?;
            if !seen_principals.insert(entry.principal.as_str()) {
                return Err(ClawchatError::Conflict {
                    reason: format!("duplicate identity '{}' in config", entry.principal),
                });
            }
            if entry.autoload {
                if let Some(nick) = &entry.nick {
                    if !seen_nicks.insert(nick.as_str()) {
                        return Err(ClawchatError::Conflict {
                            reason: format!("duplicate nick '{nick}' across autoloaded identities"),
                        });
                    }
                }
            }
            for allowed in &entry.allowed_remote_peers {
                if allowed != "*" {
                    Principal::parse(allowed)?;
                }
            }
        }
        Ok(())
    }

    /// Adds an identity entry, rejecting duplicates.
    pub fn add_identity(&mut self, entry: IdentityConfig) -> Result<()> {
        if self
            .identities
            .iter()
            .any(|existing| existing.principal == entry.principal)
        {
            return Err(ClawchatError::Conflict {
                reason: format!("identity '{}' already configured", entry.principal),
            });
        }
        self.identities.push(entry);
        self.validate()
    }

    /// Entries flagged for autoload, in config order.
    pub fn autoload_identities(&self) -> impl Iterator<Item = &IdentityConfig> {
        self.identities.iter().filter(|e| e.autoload)
    }

    /// The wake hook program, config first, then environment.
    pub fn wake_hook_program(&self) -> Option<String> {
        if let Some(hook) = &self.wake_hook {
            if !hook.is_empty() {
                return Some(hook.clone());
            }
        }
        std::env::var("CLAWCHAT_WAKE_HOOK").ok().filter(|s| !s.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(byte: u8) -> Principal {
        Principal::local_from_public_key(&[byte; 32])
    }

    fn entry(byte: u8, nick: Option<&str>) -> IdentityConfig {
        IdentityConfig {
            principal: principal(byte),
            nick: nick.map(str::to_string),
            autoload: true,
            allow_local: false,
            allowed_remote_peers: vec!["*".into()],
            openclaw_wake: false,
        }
    }

    #[test]
    fn roundtrip_through_file() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gateway-config.json");

        let mut config = GatewayConfig::new(19000);
        config.add_identity(entry(1, Some("alice")))?;
        config.save(&path)?;

        let loaded = GatewayConfig::load(&path)?;
        assert_eq!(loaded.p2p_port, 19000);
        assert_eq!(loaded.identities.len(), 1);
        assert_eq!(loaded.identities[0].nick.as_deref(), Some("alice"));
        Ok(())
    }

    #[test]
    fn duplicate_nick_rejected() {
        let mut config = GatewayConfig::new(19000);
        config.add_identity(entry(1, Some("alice"))).expect("first");
        assert!(matches!(
            config.add_identity(entry(2, Some("alice"))),
            Err(ClawchatError::Conflict { .. })
        ));
    }

    #[test]
    fn duplicate_nick_allowed_when_not_autoloaded() -> Result<()> {
        let mut config = GatewayConfig::new(19000);
        config.add_identity(entry(1, Some("alice")))?;
        let mut dormant = entry(2, Some("alice"));
        dormant.autoload = false;
        config.add_identity(dormant)?;
        Ok(())
    }

    #[test]
    fn duplicate_principal_rejected() {
        let mut config = GatewayConfig::new(19000);
        config.add_identity(entry(1, None)).expect("first");
        assert!(config.add_identity(entry(1, None)).is_err());
    }

    #[test]
    fn wrong_version_rejected() {
        let config = GatewayConfig {
            version: 2,
            ..GatewayConfig::new(19000)
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_acl_entry_rejected() {
        let mut config = GatewayConfig::new(19000);
        let mut bad = entry(1, None);
        bad.allowed_remote_peers = vec!["not-a-principal".into()];
        config.identities.push(bad);
        assert!(config.validate().is_err());
    }

    #[test]
    fn wildcard_acl_accepted() -> Result<()> {
        let mut config = GatewayConfig::new(19000);
        config.add_identity(entry(1, None))?;
        config.validate()
    }

    #[test]
    fn camel_case_field_names() -> Result<()> {
        let mut config = GatewayConfig::new(19000);
        config.add_identity(entry(1, None))?;
        let json = serde_json::to_value(&config).map_err(|e| ClawchatError::Config {
            reason: e.to_string(),
        })?;
        assert!(json.get("p2pPort").is_some());
        assert!(json["identities"][0].get("allowedRemotePeers").is_some());
        assert!(json["identities"][0].get("openclawWake").is_some());
        Ok(())
    }
}
