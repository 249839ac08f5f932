//! Per-identity peer book.
//!
//! Records are keyed by remote principal. Addresses are a set and
//! merge on every learn event — the merge is idempotent and
//! commutative, so gossip arriving in any order converges to the same
//! book. `verified` flips true only on first-hand authentication and
//! is never set by gossip.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use clawchat_types::{
    ClawchatError, NodeKey, PeerRecord, Principal, Result, Timestamp, Visibility,
};

// ---------------------------------------------------------------------------
// PeerBook
// ---------------------------------------------------------------------------

/// One identity's known-peer table, persisted as `peers.json`.
pub struct PeerBook {
    path: PathBuf,
    inner: Mutex<BTreeMap<Principal, PeerRecord>>,
}

impl PeerBook {
    /// Opens a peer book file, starting empty when it does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records: Vec<PeerRecord> = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| ClawchatError::Storage {
                reason: format!("malformed peer book '{}': {e}", path.display()),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(ClawchatError::Storage {
                    reason: format!("failed to read peer book '{}': {e}", path.display()),
                });
            }
        };

        let mut map = BTreeMap::new();
        for record in records {
            map.insert(record.principal.clone(), record);
        }
        Ok(Self {
            path,
            inner: Mutex::new(map),
        })
    }

    /// Adds or extends a record from an explicit `peer_add`.
    pub fn add(
        &self,
        principal: &Principal,
        address: Option<String>,
        alias: Option<String>,
        visibility: Option<Visibility>,
    ) -> Result<()> {
        let mut map = self.lock()?;
        let record = map
            .entry(principal.clone())
            .or_insert_with(|| PeerRecord::new(principal.clone()));
        if let Some(addr) = address {
            record.addresses.insert(addr);
        }
        if let Some(alias) = alias {
            record.alias = Some(alias);
        }
        if let Some(vis) = visibility {
            record.visibility = vis;
        }
        self.persist(&map)
    }

    /// Deletes a record. Removal is always explicit.
    pub fn remove(&self, principal: &Principal) -> Result<()> {
        let mut map = self.lock()?;
        if map.remove(principal).is_none() {
            return Err(ClawchatError::NotFound {
                what: format!("peer {principal}"),
            });
        }
        self.persist(&map)
    }

    /// Records a first-hand authenticated session with the peer:
    /// upgrades to verified, refreshes `lastSeen`, and ensures the
    /// node key and observed address are present.
    pub fn mark_authenticated(
        &self,
        principal: &Principal,
        node_key: NodeKey,
        address: Option<String>,
        now: Timestamp,
    ) -> Result<()> {
        let mut map = self.lock()?;
        let record = map
            .entry(principal.clone())
            .or_insert_with(|| PeerRecord::new(principal.clone()));
        record.verified = true;
        record.node_key = Some(node_key);
        record.last_seen = Some(now);
        record.source = None;
        if let Some(addr) = address {
            record.addresses.insert(addr);
        }
        self.persist(&map)
    }

    /// Merges a gossiped record. Never upgrades `verified`; keeps the
    /// freshest `lastSeen`; unions addresses.
    pub fn merge_gossip(
        &self,
        principal: &Principal,
        node_key: Option<NodeKey>,
        addresses: &[String],
        visibility: Visibility,
        source: &Principal,
        seen: Option<Timestamp>,
    ) -> Result<()> {
        let mut map = self.lock()?;
        let record = map
            .entry(principal.clone())
            .or_insert_with(|| PeerRecord::new(principal.clone()));

        record.addresses.extend(addresses.iter().cloned());
        if !record.verified {
            // Gossip may fill in advisory fields, never first-hand ones.
            if record.node_key.is_none() {
                record.node_key = node_key;
            }
            record.source = Some(source.clone());
            record.visibility = visibility;
        }
        match (record.last_seen, seen) {
            (None, Some(ts)) => record.last_seen = Some(ts),
            (Some(old), Some(ts)) if ts > old => record.last_seen = Some(ts),
            _ => {}
        }
        self.persist(&map)
    }

    /// Looks up one record.
    pub fn get(&self, principal: &Principal) -> Result<Option<PeerRecord>> {
        Ok(self.lock()?.get(principal).cloned())
    }

    /// Known addresses for a principal, in set order.
    pub fn addresses_for(&self, principal: &Principal) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .get(principal)
            .map(|r| r.addresses.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Full snapshot in principal order.
    pub fn snapshot(&self) -> Result<Vec<PeerRecord>> {
        Ok(self.lock()?.values().cloned().collect())
    }

    /// Verified records only — the gossipable subset.
    pub fn verified(&self) -> Result<Vec<PeerRecord>> {
        Ok(self
            .lock()?
            .values()
            .filter(|r| r.verified)
            .cloned()
            .collect())
    }

    // -- Internal ----------------------------------------------------------

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<Principal, PeerRecord>>> {
        self.inner.lock().map_err(|e| ClawchatError::Storage {
            reason: format!("peer book lock poisoned: {e}"),
        })
    }

    fn persist(&self, map: &BTreeMap<Principal, PeerRecord>) -> Result<()> {
        let records: Vec<&PeerRecord> = map.values().collect();
        let json = serde_json::to_vec_pretty(&records).map_err(|e| ClawchatError::Storage {
            reason: format!("failed to serialize peer book: {e}"),
        })?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)
            .and_then(|()| std::fs::rename(&tmp, &self.path))
            .map_err(|e| ClawchatError::Storage {
                reason: format!("peer book write to '{}' failed: {e}", self.path.display()),
            })
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

    fn book(dir: &tempfile::TempDir) -> PeerBook {
        PeerBook::open(dir.path().join("peers.json")).expect("open")
    }

    #[test]
    fn add_merges_addresses_as_set() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let book = book(&dir);
        let p = principal(1);

        book.add(&p, Some("/ip4/10.0.0.1/tcp/1".into()), None, None)?;
        book.add(&p, Some("/ip4/10.0.0.2/tcp/2".into()), Some("ally".into()), None)?;
        book.add(&p, Some("/ip4/10.0.0.1/tcp/1".into()), None, None)?;

        let record = book.get(&p)?.expect("record");
        assert_eq!(record.addresses.len(), 2);
        assert_eq!(record.alias.as_deref(), Some("ally"));
        Ok(())
    }

    #[test]
    fn persists_across_reopen() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("peers.json");
        let p = principal(1);
        {
            let book = PeerBook::open(&path)?;
            book.add(&p, Some("/ip4/10.0.0.1/tcp/1".into()), None, None)?;
        }
        let book = PeerBook::open(&path)?;
        assert!(book.get(&p)?.is_some());
        Ok(())
    }

    #[test]
    fn remove_is_explicit_and_errors_on_missing() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let book = book(&dir);
        let p = principal(1);
        book.add(&p, None, None, None)?;
        book.remove(&p)?;
        assert!(book.get(&p)?.is_none());
        assert!(matches!(
            book.remove(&p),
            Err(ClawchatError::NotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn gossip_never_sets_verified() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let book = book(&dir);
        let p = principal(1);
        let source = principal(9);

        book.merge_gossip(
            &p,
            Some(NodeKey::new([0x0A; 32])),
            &["/ip4/10.0.0.1/tcp/1".into()],
            Visibility::Public,
            &source,
            Some(Timestamp::from_millis(5)),
        )?;

        let record = book.get(&p)?.expect("record");
        assert!(!record.verified);
        assert_eq!(record.source.as_ref(), Some(&source));
        Ok(())
    }

    #[test]
    fn authentication_upgrades_and_gossip_cannot_downgrade() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let book = book(&dir);
        let p = principal(1);
        let source = principal(9);

        book.mark_authenticated(
            &p,
            NodeKey::new([0x0B; 32]),
            Some("/ip4/10.0.0.1/tcp/1".into()),
            Timestamp::from_millis(100),
        )?;
        book.merge_gossip(
            &p,
            Some(NodeKey::new([0xFF; 32])),
            &["/ip4/10.0.0.2/tcp/2".into()],
            Visibility::Friends,
            &source,
            Some(Timestamp::from_millis(50)),
        )?;

        let record = book.get(&p)?.expect("record");
        assert!(record.verified);
        // First-hand node key survives gossip.
        assert_eq!(record.node_key, Some(NodeKey::new([0x0B; 32])));
        // Addresses still merged.
        assert_eq!(record.addresses.len(), 2);
        // Older gossip sighting does not regress lastSeen.
        assert_eq!(record.last_seen, Some(Timestamp::from_millis(100)));
        Ok(())
    }

    #[test]
    fn merge_is_commutative_on_addresses() -> Result<()> {
        let addrs_a = vec!["/ip4/1.1.1.1/tcp/1".to_string()];
        let addrs_b = vec!["/ip4/2.2.2.2/tcp/2".to_string()];
        let p = principal(1);
        let source = principal(9);

        let dir1 = tempfile::tempdir().expect("tempdir");
        let book1 = book(&dir1);
        book1.merge_gossip(&p, None, &addrs_a, Visibility::Public, &source, None)?;
        book1.merge_gossip(&p, None, &addrs_b, Visibility::Public, &source, None)?;

        let dir2 = tempfile::tempdir().expect("tempdir");
        let book2 = book(&dir2);
        book2.merge_gossip(&p, None, &addrs_b, Visibility::Public, &source, None)?;
        book2.merge_gossip(&p, None, &addrs_a, Visibility::Public, &source, None)?;

        assert_eq!(
            book1.get(&p)?.expect("r").addresses,
            book2.get(&p)?.expect("r").addresses
        );
        Ok(())
    }

    #[test]
    fn verified_subset() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let book = book(&dir);
        book.mark_authenticated(&principal(1), NodeKey::new([1; 32]), None, Timestamp::now())?;
        book.merge_gossip(
            &principal(2),
            None,
            &[],
            Visibility::Public,
            &principal(9),
            None,
        )?;

        assert_eq!(book.verified()?.len(), 1);
        assert_eq!(book.snapshot()?.len(), 2);
        Ok(())
    }
}
