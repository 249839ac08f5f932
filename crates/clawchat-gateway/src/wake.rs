//! External wake hook.
//!
//! Identities with `openclawWake` set invoke an external program on
//! inbound deliveries: "immediate" for bodies starting with `URGENT:`,
//! `ALERT:`, or `CRITICAL:` (ASCII, case-sensitive), "deferred"
//! otherwise. Fire-and-forget with a 5 s kill timeout; a hook failure
//! never fails message delivery.

use std::time::Duration;

use clawchat_types::Principal;

/// Kill deadline for a hook invocation.
const HOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Prefixes that select immediate mode.
const URGENT_PREFIXES: [&str; 3] = ["URGENT:", "ALERT:", "CRITICAL:"];

/// Hook invocation mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WakeMode {
    /// Content carries an urgency prefix.
    Immediate,
    /// Every other delivery.
    Deferred,
}

impl WakeMode {
    /// Classifies a message body.
    pub fn for_content(content: &str) -> Self {
        if URGENT_PREFIXES.iter().any(|p| content.starts_with(p)) {
            Self::Immediate
        } else {
            Self::Deferred
        }
    }

    fn as_arg(self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Deferred => "deferred",
        }
    }
}

/// Fires the hook in the background. Never blocks the caller and
/// never propagates failure.
pub fn invoke(program: &str, mode: WakeMode, identity: &Principal) {
    let program = program.to_string();
    let principal = identity.to_string();

    tokio::spawn(async move {
        let child = tokio::process::Command::new(&program)
            .arg(mode.as_arg())
            .arg(&principal)
            .kill_on_drop(true)
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(%program, %e, "wake hook failed to start");
                return;
            }
        };

        match tokio::time::timeout(HOOK_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) if !status.success() => {
                tracing::warn!(%program, %status, "wake hook exited nonzero");
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::warn!(%program, %e, "wake hook wait failed");
            }
            Err(_) => {
                tracing::warn!(%program, "wake hook timed out; killing");
                let _ = child.kill().await;
            }
        }
    });
}
