//! On-disk layout of a gateway data directory.
//!
//! ```text
//! <root>/
//!   gateway-config.json
//!   daemon.pid
//!   clawchat.sock
//!   identities/
//!     <principal>/
//!       identity.enc
//!       inbox.json
//!       outbox.json
//!       peers.json
//! ```
//!
//! The legacy single-identity layout keeps the same files directly
//! under `<root>` with no `identities/<principal>/` level.

use std::path::{Path, PathBuf};

use clawchat_types::Principal;

/// File names inside an identity directory.
pub const INBOX_FILE: &str = "inbox.json";
/// File names inside an identity directory.
pub const OUTBOX_FILE: &str = "outbox.json";
/// File names inside an identity directory.
pub const PEERS_FILE: &str = "peers.json";

/// Resolved paths under one gateway data root.
#[derive(Clone, Debug)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    /// Wraps an explicit data root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The default per-user root: `$CLAWCHAT_HOME`, else `~/.clawchat`.
    pub fn default_root() -> Self {
        if let Ok(dir) = std::env::var("CLAWCHAT_HOME") {
            if !dir.is_empty() {
                return Self::new(dir);
            }
        }
        let root = dirs::home_dir()
            .map(|home| home.join(".clawchat"))
            .unwrap_or_else(|| PathBuf::from(".clawchat"));
        Self::new(root)
    }

    /// The data root itself.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `gateway-config.json`.
    pub fn config_path(&self) -> PathBuf {
        self.root.join("gateway-config.json")
    }

    /// `daemon.pid`.
    pub fn pid_path(&self) -> PathBuf {
        self.root.join("daemon.pid")
    }

    /// The IPC socket endpoint.
    pub fn socket_path(&self) -> PathBuf {
        self.root.join("clawchat.sock")
    }

    /// The `identities/` container directory.
    pub fn identities_dir(&self) -> PathBuf {
        self.root.join("identities")
    }

    /// The directory holding one identity's files.
    ///
    /// In the legacy single-identity layout this is the root itself.
    pub fn identity_dir(&self, principal: &Principal) -> PathBuf {
        if self.is_legacy() {
            self.root.clone()
        } else {
            self.identities_dir().join(principal.as_str())
        }
    }

    /// Directory for an identity that is being created (always the
    /// multi-identity location; new identities never extend the
    /// legacy layout).
    pub fn new_identity_dir(&self, principal: &Principal) -> PathBuf {
        self.identities_dir().join(principal.as_str())
    }

    /// True when the root follows the legacy single-identity layout:
    /// an `identity.enc` at the root and no `identities/` directory.
    pub fn is_legacy(&self) -> bool {
        self.root.join("identity.enc").is_file() && !self.identities_dir().is_dir()
    }

    /// Lists principals with identity directories on disk.
    pub fn stored_principals(&self) -> Vec<Principal> {
        let mut out = Vec::new();
        let Ok(entries) = std::fs::read_dir(self.identities_dir()) else {
            return out;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if let Some(name) = name.to_str() {
                if let Ok(principal) = Principal::parse(name) {
                    if entry.path().join("identity.enc").is_file() {
                        out.push(principal);
                    }
                }
            }
        }
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal() -> Principal {
        Principal::local_from_public_key(&[0x42; 32])
    }

    #[test]
    fn multi_identity_paths() {
        let layout = DataLayout::new("/tmp/claw-test");
        let dir = layout.identity_dir(&principal());
        assert!(dir.starts_with("/tmp/claw-test/identities"));
        assert!(dir.ends_with(principal().as_str()));
        assert_eq!(layout.socket_path(), Path::new("/tmp/claw-test/clawchat.sock"));
    }

    #[test]
    fn legacy_layout_detected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let layout = DataLayout::new(tmp.path());
        assert!(!layout.is_legacy());

        std::fs::write(tmp.path().join("identity.enc"), b"x").expect("write");
        assert!(layout.is_legacy());
        assert_eq!(layout.identity_dir(&principal()), tmp.path());

        // Presence of identities/ flips back to the modern layout.
        std::fs::create_dir_all(layout.identities_dir()).expect("mkdir");
        assert!(!layout.is_legacy());
    }

    #[test]
    fn stored_principals_lists_valid_dirs_only() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let layout = DataLayout::new(tmp.path());

        let p = principal();
        let dir = layout.new_identity_dir(&p);
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(dir.join("identity.enc"), b"x").expect("write");

        // A directory that is not a principal is skipped.
        std::fs::create_dir_all(layout.identities_dir().join("junk")).expect("mkdir");
        // A principal directory without an identity file is skipped.
        std::fs::create_dir_all(
            layout
                .identities_dir()
                .join(Principal::local_from_public_key(&[0x01; 32]).as_str()),
        )
        .expect("mkdir");

        assert_eq!(layout.stored_principals(), vec![p]);
    }
}
