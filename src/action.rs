//! Polling of asynchronous droplet actions

use crate::api::{ActionStatus, ComputeApi};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Poll action `id` every `interval` until it completes or errors.
///
/// Returns `true` on `completed` and `false` on `errored`. Failures to
/// fetch the action are retried indefinitely: the mutation is already
/// underway on a billed droplet, and giving up would leave it unattended.
pub async fn await_action(api: &dyn ComputeApi, id: u64, interval: Duration) -> bool {
    let mut attempts: u64 = 0;
    loop {
        attempts += 1;
        match api.get_action(id).await {
            Ok(action) => match action.status {
                ActionStatus::Completed => {
                    debug!(action_id = id, kind = %action.kind, attempts, "Action completed");
                    return true;
                }
                ActionStatus::Errored => {
                    error!(
                        action_id = id,
                        kind = %action.kind,
                        resource_id = ?action.resource_id,
                        "Action failed"
                    );
                    return false;
                }
                ActionStatus::InProgress => {}
            },
            Err(e) => {
                warn!(action_id = id, attempts, error = %e, "Could not fetch action status, retrying");
            }
        }
        tokio::time::sleep(interval).await;
    }
}
