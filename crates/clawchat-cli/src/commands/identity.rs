//! Offline identity operations: create, recover, show, nick changes.
//!
//! These act directly on encrypted identity files — the daemon need
//! not be running. The mnemonic of a new stacks identity is printed
//! exactly once, here, and never again.

use clap::Subcommand;
use serde_json::{json, Value};

use clawchat_identity::{store, Identity};
use clawchat_types::Principal;

use crate::Ctx;

#[derive(Subcommand)]
pub enum IdentityAction {
    /// Generate a fresh identity.
    Create {
        /// Identity mode: "local" or "stacks".
        #[arg(long, default_value = "local")]
        mode: String,
        /// Use the test network (stacks mode only).
        #[arg(long)]
        testnet: bool,
        /// Display nick to store with the identity.
        #[arg(long)]
        nick: Option<String>,
    },
    /// Rebuild a stacks identity from its 24-word mnemonic.
    Recover {
        /// The space-separated mnemonic phrase.
        #[arg(long)]
        mnemonic: String,
        /// Use the test network.
        #[arg(long)]
        testnet: bool,
    },
    /// Show a stored identity's public fields.
    Show {
        /// Principal to show; may be omitted when only one exists.
        #[arg(long)]
        principal: Option<String>,
    },
    /// Set the display nick (re-encrypts the identity file).
    SetNick {
        /// The new nick.
        nick: String,
        /// Principal to modify; may be omitted when only one exists.
        #[arg(long)]
        principal: Option<String>,
    },
    /// Clear the display nick (re-encrypts the identity file).
    ClearNick {
        /// Principal to modify; may be omitted when only one exists.
        #[arg(long)]
        principal: Option<String>,
    },
}

pub fn run(ctx: &Ctx, action: IdentityAction) -> Result<Value, String> {
    match action {
        IdentityAction::Create {
            mode,
            testnet,
            nick,
        } => create(ctx, &mode, testnet, nick),
        IdentityAction::Recover { mnemonic, testnet } => recover(ctx, &mnemonic, testnet),
        IdentityAction::Show { principal } => show(ctx, principal.as_deref()),
        IdentityAction::SetNick { nick, principal } => {
            set_nick(ctx, principal.as_deref(), Some(nick))
        }
        IdentityAction::ClearNick { principal } => set_nick(ctx, principal.as_deref(), None),
    }
}

fn create(ctx: &Ctx, mode: &str, testnet: bool, nick: Option<String>) -> Result<Value, String> {
    let passphrase = ctx.require_passphrase()?;

    let (mut identity, mnemonic) = match mode {
        "local" => (Identity::create_local(), None),
        "stacks" => {
            let (identity, phrase) =
                Identity::create_stacks(testnet).map_err(|e| e.to_string())?;
            (identity, Some(phrase.to_string()))
        }
        other => return Err(format!("unknown identity mode '{other}'")),
    };
    identity.set_nick(nick);

    let dir = ctx.data.new_identity_dir(identity.principal());
    if store::exists(&dir) {
        return Err(format!("identity '{}' already exists", identity.principal()));
    }
    store::save(&identity, passphrase, &dir).map_err(|e| e.to_string())?;

    let mut out = json!({
        "principal": identity.principal(),
        "mode": mode,
        "nick": identity.nick(),
    });
    if let Some(phrase) = mnemonic {
        // Shown once; it is never stored in plaintext.
        out["mnemonic"] = Value::String(phrase);
    }
    Ok(out)
}

fn recover(ctx: &Ctx, mnemonic: &str, testnet: bool) -> Result<Value, String> {
    let passphrase = ctx.require_passphrase()?;
    let identity = Identity::recover_stacks(mnemonic, testnet).map_err(|e| e.to_string())?;

    let dir = ctx.data.new_identity_dir(identity.principal());
    store::save(&identity, passphrase, &dir).map_err(|e| e.to_string())?;

    Ok(json!({
        "principal": identity.principal(),
        "mode": "stacks",
        "recovered": true,
    }))
}

fn show(ctx: &Ctx, principal: Option<&str>) -> Result<Value, String> {
    let passphrase = ctx.require_passphrase()?;
    let dir = resolve_identity_dir(ctx, principal)?;
    let identity = store::load(&dir, passphrase).map_err(|e| e.to_string())?;

    Ok(json!({
        "principal": identity.principal(),
        "mode": identity.mode().to_string(),
        "nick": identity.nick(),
        "testnet": identity.is_testnet(),
        "nodeKey": identity.stored_node_key(),
    }))
}

fn set_nick(ctx: &Ctx, principal: Option<&str>, nick: Option<String>) -> Result<Value, String> {
    let passphrase = ctx.require_passphrase()?;
    let dir = resolve_identity_dir(ctx, principal)?;
    let identity = store::set_nick(&dir, passphrase, nick).map_err(|e| e.to_string())?;

    Ok(json!({
        "principal": identity.principal(),
        "nick": identity.nick(),
    }))
}

/// Picks the identity directory: an explicit principal, the legacy
/// root, or the sole stored identity.
fn resolve_identity_dir(
    ctx: &Ctx,
    principal: Option<&str>,
) -> Result<std::path::PathBuf, String> {
    if let Some(raw) = principal {
        let principal = Principal::parse(raw).map_err(|e| e.to_string())?;
        return Ok(ctx.data.identity_dir(&principal));
    }
    if ctx.data.is_legacy() {
        return Ok(ctx.data.root().to_path_buf());
    }
    let stored = ctx.data.stored_principals();
    match stored.as_slice() {
        [only] => Ok(ctx.data.identity_dir(only)),
        [] => Err("no identities found — create one first".into()),
        _ => Err("several identities exist; pass --principal".into()),
    }
}
