//! Cross-user safety: logout parking, login restoration and the
//! switch-time decision that keeps one agent's queued work invisible and
//! inert under another agent's session.

use ct_core::types::{QueuedOperation, UserId};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::QueueResult;
use crate::queue::OperationQueue;

/// Decision for a login following someone's queued work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UserSwitchOutcome {
    /// No parked ops, or they all belong to the logging-in user (and were
    /// restored to `pending`).
    #[serde(rename_all = "camelCase")]
    Continue { restored: u64 },
    /// Parked ops belong to someone else; the new user must not sync
    /// until they are resolved or explicitly wiped.
    #[serde(rename_all = "camelCase")]
    Block { owners: Vec<String>, count: u64 },
    /// Explicit, confirmed wipe of the whole queue.
    #[serde(rename_all = "camelCase")]
    Wiped { removed: u64 },
}

impl UserSwitchOutcome {
    #[must_use]
    pub fn blocks_sync(&self) -> bool {
        matches!(self, Self::Block { .. })
    }
}

impl OperationQueue {
    /// Logout: every `pending`/`failed` op owned by this user moves to
    /// `pending_auth`.
    pub async fn handle_logout(&self, user_id: &UserId) -> QueueResult<u64> {
        let parked = self.store().ops().park_for_user(user_id.as_str()).await?;
        info!(user = %user_id, parked, "User logged out, ops parked");
        Ok(parked)
    }

    /// Login-time decision per the cross-user contract.
    pub async fn handle_user_switch(&self, new_user: &UserId) -> QueueResult<UserSwitchOutcome> {
        let owners = self.store().ops().pending_auth_owners().await?;

        let foreign: Vec<(String, u64)> = owners
            .into_iter()
            .filter(|(owner, _)| owner != new_user.as_str())
            .collect();
        if !foreign.is_empty() {
            let count = foreign.iter().map(|(_, n)| n).sum();
            let owners: Vec<String> = foreign.into_iter().map(|(owner, _)| owner).collect();
            warn!(user = %new_user, ?owners, count, "Foreign parked ops block sync");
            return Ok(UserSwitchOutcome::Block { owners, count });
        }

        let restored = self.store().ops().restore_for_user(new_user.as_str()).await?;
        if restored > 0 {
            info!(user = %new_user, restored, "Parked ops restored to pending");
        }
        Ok(UserSwitchOutcome::Continue { restored })
    }

    /// Ops owned by another user that are not parked. Any hit is a
    /// cross-user leak.
    pub async fn validate_user_ownership(
        &self,
        user_id: &UserId,
    ) -> QueueResult<Vec<QueuedOperation>> {
        let orphans = self.store().ops().orphans_for(user_id.as_str()).await?;
        if !orphans.is_empty() {
            warn!(
                user = %user_id,
                orphans = orphans.len(),
                "Orphaned ops found for another user"
            );
        }
        Ok(orphans)
    }

    /// Explicit admin/user-confirmed clear of the whole queue.
    pub async fn wipe_queue(&self) -> QueueResult<UserSwitchOutcome> {
        let removed = self.store().ops().clear_all().await?;
        warn!(removed, "Operation queue wiped");
        Ok(UserSwitchOutcome::Wiped { removed })
    }
}
