//! Identity manager: the set of loaded identities and their isolated
//! per-identity state.
//!
//! Each loaded identity owns its own inbox, outbox, peer book, and
//! ACL. Nothing is shared across identities except the transport and
//! the IPC socket, and the on-disk layout mirrors that isolation.

use std::collections::HashMap;
use std::sync::Arc;

use clawchat_identity::{store, Identity};
use clawchat_storage::{layout, DataLayout, Mailbox, PeerBook};
use clawchat_types::{ClawchatError, Principal, Result};

use crate::config::IdentityConfig;

// ---------------------------------------------------------------------------
// Acl
// ---------------------------------------------------------------------------

/// Per-identity inbound allow-list.
#[derive(Clone, Debug, Default)]
pub struct Acl {
    allow_all: bool,
    allow_local: bool,
    allowed: Vec<Principal>,
}

impl Acl {
    /// Builds the ACL from a config entry.
    pub fn from_entry(entry: &IdentityConfig) -> Result<Self> {
        let mut acl = Self {
            allow_all: false,
            allow_local: entry.allow_local,
            allowed: Vec::new(),
        };
        for item in &entry.allowed_remote_peers {
            if item == "*" {
                acl.allow_all = true;
            } else {
                acl.allowed.push(Principal::parse(item)?);
            }
        }
        Ok(acl)
    }

    /// Whether `remote` may deliver inbound messages.
    pub fn permits(&self, remote: &Principal) -> bool {
        if self.allow_all {
            return true;
        }
        if self.allow_local && remote.as_str().starts_with(Principal::LOCAL_PREFIX) {
            return true;
        }
        self.allowed.iter().any(|p| p == remote)
    }
}

// ---------------------------------------------------------------------------
// IdentityState
// ---------------------------------------------------------------------------

/// Everything one loaded identity owns.
pub struct IdentityState {
    /// The identity and its key material.
    pub identity: Arc<Identity>,
    /// Inbound allow-list.
    pub acl: Acl,
    /// Invoke the wake hook on deliveries.
    pub wake: bool,
    /// Durable inbox.
    pub inbox: Arc<Mailbox>,
    /// Durable outbox.
    pub outbox: Arc<Mailbox>,
    /// Known-peer records.
    pub peers: Arc<PeerBook>,
}

// ---------------------------------------------------------------------------
// IdentityManager
// ---------------------------------------------------------------------------

/// Principal → state map with nick aliasing and a default identity.
pub struct IdentityManager {
    states: HashMap<Principal, IdentityState>,
    /// Load order; the first entry is the default identity.
    order: Vec<Principal>,
    nicks: HashMap<String, Principal>,
}

impl IdentityManager {
    /// An empty manager.
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
            order: Vec::new(),
            nicks: HashMap::new(),
        }
    }

    /// Loads one configured identity from disk and registers it.
    ///
    /// # Errors
    ///
    /// - [`ClawchatError::Conflict`] on a duplicate nick or principal.
    /// - Whatever [`store::load`] reports (missing file, bad
    ///   passphrase).
    pub fn load(
        &mut self,
        data: &DataLayout,
        entry: &IdentityConfig,
        passphrase: &str,
    ) -> Result<()> {
        if self.states.contains_key(&entry.principal) {
            return Err(ClawchatError::Conflict {
                reason: format!("identity '{}' already loaded", entry.principal),
            });
        }

        let dir = data.identity_dir(&entry.principal);
        let mut identity = store::load(&dir, passphrase)?;
        if identity.principal() != &entry.principal {
            return Err(ClawchatError::Config {
                reason: format!(
                    "identity directory '{}' holds principal '{}'",
                    dir.display(),
                    identity.principal()
                ),
            });
        }

        // The config nick wins over the stored one for this process.
        if let Some(nick) = &entry.nick {
            identity.set_nick(Some(nick.clone()));
        }
        if let Some(nick) = identity.nick() {
            if self.nicks.contains_key(nick) {
                return Err(ClawchatError::Conflict {
                    reason: format!("duplicate nick '{nick}'"),
                });
            }
            self.nicks.insert(nick.to_string(), entry.principal.clone());
        }

        let state = IdentityState {
            identity: Arc::new(identity),
            acl: Acl::from_entry(entry)?,
            wake: entry.openclaw_wake,
            inbox: Arc::new(Mailbox::open(dir.join(layout::INBOX_FILE))?),
            outbox: Arc::new(Mailbox::open(dir.join(layout::OUTBOX_FILE))?),
            peers: Arc::new(PeerBook::open(dir.join(layout::PEERS_FILE))?),
        };

        self.order.push(entry.principal.clone());
        self.states.insert(entry.principal.clone(), state);
        tracing::info!(principal = %entry.principal, "identity loaded");
        Ok(())
    }

    /// Drops one identity and its state handles.
    pub fn unload(&mut self, principal: &Principal) -> Result<()> {
        let state = self
            .states
            .remove(principal)
            .ok_or_else(|| ClawchatError::NotFound {
                what: format!("identity {principal}"),
            })?;
        if let Some(nick) = state.identity.nick() {
            self.nicks.remove(nick);
        }
        self.order.retain(|p| p != principal);
        Ok(())
    }

    /// Loaded principals in load order.
    pub fn principals(&self) -> Vec<Principal> {
        self.order.clone()
    }

    /// The default identity: first in load (configuration) order.
    pub fn default_principal(&self) -> Result<&Principal> {
        self.order.first().ok_or_else(|| ClawchatError::NotFound {
            what: "no identities loaded".into(),
        })
    }

    /// Resolves a `--as` selector: exact nick match first, then a
    /// principal string; `None` selects the default identity.
    pub fn resolve(&self, selector: Option<&str>) -> Result<&Principal> {
        let Some(selector) = selector else {
            return self.default_principal();
        };
        if let Some(principal) = self.nicks.get(selector) {
            return Ok(principal);
        }
        let principal = Principal::parse(selector).map_err(|_| ClawchatError::NotFound {
            what: format!("identity '{selector}'"),
        })?;
        self.states
            .get_key_value(&principal)
            .map(|(k, _)| k)
            .ok_or_else(|| ClawchatError::NotFound {
                what: format!("identity '{selector}'"),
            })
    }

    /// State for a loaded principal.
    pub fn get(&self, principal: &Principal) -> Result<&IdentityState> {
        self.states.get(principal).ok_or_else(|| ClawchatError::NotFound {
            what: format!("identity {principal}"),
        })
    }

    /// State via a `--as` selector.
    pub fn resolve_state(&self, selector: Option<&str>) -> Result<&IdentityState> {
        let principal = self.resolve(selector)?.clone();
        self.get(&principal)
    }

    /// Whether a principal is one of ours.
    pub fn is_local_identity(&self, principal: &Principal) -> bool {
        self.states.contains_key(principal)
    }

    /// Iterates all loaded states in load order.
    pub fn iter(&self) -> impl Iterator<Item = (&Principal, &IdentityState)> {
        self.order
            .iter()
            .filter_map(|p| self.states.get(p).map(|s| (p, s)))
    }

    /// Snapshot of identity handles for handshake tasks.
    pub fn handshake_catalog(&self) -> HandshakeCatalog {
        HandshakeCatalog {
            identities: self
                .states
                .iter()
                .map(|(p, s)| (p.clone(), Arc::clone(&s.identity)))
                .collect(),
            default_principal: self.order.first().cloned(),
        }
    }
}

impl Default for IdentityManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// HandshakeCatalog
// ---------------------------------------------------------------------------

/// Read-only identity snapshot handed to inbound handshake tasks so
/// they can pick a responder identity and sign attestations without
/// touching the event loop.
#[derive(Clone)]
pub struct HandshakeCatalog {
    identities: HashMap<Principal, Arc<Identity>>,
    default_principal: Option<Principal>,
}

impl HandshakeCatalog {
    /// Picks the responder identity for an inbound hello.
    ///
    /// A known `target` wins; otherwise the default identity answers.
    pub fn select(&self, target: Option<&Principal>) -> Result<(Principal, Arc<Identity>)> {
        let principal = match target {
            Some(target) if self.identities.contains_key(target) => target.clone(),
            Some(target) => {
                return Err(ClawchatError::NotFound {
                    what: format!("identity {target}"),
                });
            }
            None => self
                .default_principal
                .clone()
                .ok_or_else(|| ClawchatError::NotFound {
                    what: "no identities loaded".into(),
                })?,
        };
        let identity = Arc::clone(&self.identities[&principal]);
        Ok((principal, identity))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use clawchat_identity::store;

    const PASS: &str = "a long enough passphrase";

    fn setup_identity(data: &DataLayout, nick: Option<&str>) -> IdentityConfig {
        let identity = Identity::create_local();
        let principal = identity.principal().clone();
        store::save(&identity, PASS, &data.new_identity_dir(&principal)).expect("save");
        IdentityConfig {
            principal,
            nick: nick.map(str::to_string),
            autoload: true,
            allow_local: false,
            allowed_remote_peers: vec!["*".into()],
            openclaw_wake: false,
        }
    }

    #[test]
    fn load_resolve_by_nick_and_principal() -> Result<()> {
        let tmp = tempfile::tempdir().expect("tempdir");
        let data = DataLayout::new(tmp.path());
        let entry = setup_identity(&data, Some("alice"));

        let mut manager = IdentityManager::new();
        manager.load(&data, &entry, PASS)?;

        assert_eq!(manager.resolve(Some("alice"))?, &entry.principal);
        assert_eq!(manager.resolve(Some(entry.principal.as_str()))?, &entry.principal);
        assert_eq!(manager.resolve(None)?, &entry.principal);
        Ok(())
    }

    #[test]
    fn nick_match_is_case_sensitive() -> Result<()> {
        let tmp = tempfile::tempdir().expect("tempdir");
        let data = DataLayout::new(tmp.path());
        let entry = setup_identity(&data, Some("Alice"));

        let mut manager = IdentityManager::new();
        manager.load(&data, &entry, PASS)?;

        assert!(manager.resolve(Some("alice")).is_err());
        assert!(manager.resolve(Some("Alice")).is_ok());
        Ok(())
    }

    #[test]
    fn first_autoload_is_default() -> Result<()> {
        let tmp = tempfile::tempdir().expect("tempdir");
        let data = DataLayout::new(tmp.path());
        let first = setup_identity(&data, Some("a"));
        let second = setup_identity(&data, Some("b"));

        let mut manager = IdentityManager::new();
        manager.load(&data, &first, PASS)?;
        manager.load(&data, &second, PASS)?;

        assert_eq!(manager.default_principal()?, &first.principal);
        assert_eq!(manager.principals().len(), 2);
        Ok(())
    }

    #[test]
    fn duplicate_nick_rejected_at_load() -> Result<()> {
        let tmp = tempfile::tempdir().expect("tempdir");
        let data = DataLayout::new(tmp.path());
        let first = setup_identity(&data, Some("agent"));
        let second = setup_identity(&data, Some("agent"));

        let mut manager = IdentityManager::new();
        manager.load(&data, &first, PASS)?;
        assert!(matches!(
            manager.load(&data, &second, PASS),
            Err(ClawchatError::Conflict { .. })
        ));
        Ok(())
    }

    #[test]
    fn unload_removes_state_and_nick() -> Result<()> {
        let tmp = tempfile::tempdir().expect("tempdir");
        let data = DataLayout::new(tmp.path());
        let entry = setup_identity(&data, Some("alice"));

        let mut manager = IdentityManager::new();
        manager.load(&data, &entry, PASS)?;
        manager.unload(&entry.principal)?;

        assert!(manager.resolve(Some("alice")).is_err());
        assert!(manager.get(&entry.principal).is_err());
        assert!(manager.unload(&entry.principal).is_err());
        Ok(())
    }

    #[test]
    fn acl_wildcard_and_allow_local() -> Result<()> {
        let entry = IdentityConfig {
            principal: Principal::local_from_public_key(&[1; 32]),
            nick: None,
            autoload: true,
            allow_local: true,
            allowed_remote_peers: vec![],
            openclaw_wake: false,
        };
        let acl = Acl::from_entry(&entry)?;
        assert!(acl.permits(&Principal::local_from_public_key(&[2; 32])));
        assert!(!acl.permits(&Principal::parse("stacks:SPXXYYZZ")?));

        let wildcard = Acl::from_entry(&IdentityConfig {
            allowed_remote_peers: vec!["*".into()],
            allow_local: false,
            ..entry.clone()
        })?;
        assert!(wildcard.permits(&Principal::parse("stacks:SPXXYYZZ")?));
        Ok(())
    }

    #[test]
    fn acl_explicit_entries() -> Result<()> {
        let friend = Principal::local_from_public_key(&[7; 32]);
        let stranger = Principal::local_from_public_key(&[8; 32]);
        let entry = IdentityConfig {
            principal: Principal::local_from_public_key(&[1; 32]),
            nick: None,
            autoload: true,
            allow_local: false,
            allowed_remote_peers: vec![friend.to_string()],
            openclaw_wake: false,
        };
        let acl = Acl::from_entry(&entry)?;
        assert!(acl.permits(&friend));
        assert!(!acl.permits(&stranger));
        Ok(())
    }

    #[test]
    fn catalog_selects_target_or_default() -> Result<()> {
        let tmp = tempfile::tempdir().expect("tempdir");
        let data = DataLayout::new(tmp.path());
        let first = setup_identity(&data, None);
        let second = setup_identity(&data, None);

        let mut manager = IdentityManager::new();
        manager.load(&data, &first, PASS)?;
        manager.load(&data, &second, PASS)?;

        let catalog = manager.handshake_catalog();
        let (selected, _) = catalog.select(Some(&second.principal))?;
        assert_eq!(selected, second.principal);

        let (fallback, _) = catalog.select(None)?;
        assert_eq!(fallback, first.principal);

        let unknown = Principal::local_from_public_key(&[0x99; 32]);
        assert!(catalog.select(Some(&unknown)).is_err());
        Ok(())
    }
}
