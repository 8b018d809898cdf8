// Job event topics and publishing helpers

use crate::domain::{Job, JobState, StateChange};
use crate::port::{PublishOptions, Publisher};
use tracing::{debug, warn};

/// Topic carrying the uid of a job to cancel, broadcast to every replica.
pub const PUBSUB_TOPIC_CANCEL_JOB: &str = "conductor:job:cancel_job";

/// Topic carrying a JSON [`StateChange`] on every job state transition.
pub const PUBSUB_TOPIC_STATE_CHANGE: &str = "conductor:job:state_change";

/// Broadcast the current state of `job`. Failures are logged and swallowed.
pub async fn publish_state_change(publisher: &dyn Publisher, job: &Job) {
    publish_change(publisher, StateChange::from_job(job)).await
}

/// Broadcast an intermediate progress update of a running job.
pub async fn publish_progress(
    publisher: &dyn Publisher,
    uid: &str,
    job_type: &str,
    progress: i32,
    result: &str,
) {
    let change = StateChange {
        uid: uid.to_string(),
        job_type: job_type.to_string(),
        state: JobState::Running,
        progress,
        result: result.to_string(),
        failure: String::new(),
    };
    publish_change(publisher, change).await
}

async fn publish_change(publisher: &dyn Publisher, change: StateChange) {
    let payload = match change.encode() {
        Ok(payload) => payload,
        Err(e) => {
            warn!(job_uid = %change.uid, error = %e, "Failed to encode state change");
            return;
        }
    };

    match publisher
        .publish(PUBSUB_TOPIC_STATE_CHANGE, payload, PublishOptions::default())
        .await
    {
        Ok(()) => debug!(job_uid = %change.uid, state = %change.state, "State change published"),
        Err(e) => warn!(job_uid = %change.uid, error = %e, "Failed to publish state change"),
    }
}

/// Ask every replica to cancel `uid` if it is running it.
pub async fn publish_cancel(publisher: &dyn Publisher, uid: &str) -> Result<(), crate::port::PubSubError> {
    publisher
        .publish(
            PUBSUB_TOPIC_CANCEL_JOB,
            uid.as_bytes().to_vec(),
            PublishOptions::default(),
        )
        .await
}
