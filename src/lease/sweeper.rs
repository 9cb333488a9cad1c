//! Expiry sweeper — clears leases whose window has passed.
//!
//! Runs in every process (driven by the canvas maintenance task). Each pass
//! force-expires the locally known leases with `expires_at <= now`; the
//! arbitrator re-checks against the authority, so concurrent sweeps elsewhere
//! turn into no-ops instead of double events.

use tracing::warn;
use uuid::Uuid;

use super::ExpireOutcome;
use super::arbitrator::ClaimArbitrator;

/// One sweep at `now`. Returns the objects this pass actually expired.
pub async fn sweep_once(arbitrator: &ClaimArbitrator, now: i64) -> Vec<Uuid> {
    let snapshot = arbitrator.store().snapshot();
    let due: Vec<Uuid> = snapshot
        .iter()
        .filter(|lease| lease.is_expired(now))
        .map(|lease| lease.object_id)
        .collect();

    let mut expired = Vec::new();
    for object_id in due {
        match arbitrator.force_expire(object_id, now).await {
            Ok(ExpireOutcome::Expired { .. }) => expired.push(object_id),
            Ok(ExpireOutcome::NoOp) => {}
            Err(e) => warn!(%object_id, error = %e, "sweeper: force expire failed"),
        }
    }
    expired
}

#[cfg(test)]
#[path = "sweeper_test.rs"]
mod tests;
