use std::time::Duration;

use thiserror::Error;

/// What a worker should do with the queue handle after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueAction {
    /// Remove the item; the work is done or will never succeed differently.
    Ack,
    /// Release the item for retry with backoff.
    Nack,
    /// Release the item for immediate retry (no backoff).
    NackQuick,
}

/// Failure taxonomy for pipeline work items. The variant decides the queue
/// policy; user-visible failure is only ever a short `error_message` on the
/// image row.
#[derive(Error, Debug)]
pub enum WorkError {
    #[error("transient I/O: {0}")]
    TransientIo(String),

    /// Unreadable or malformed input. Terminal for the item; the image has
    /// already been moved to `failed` by the time this propagates.
    #[error("corrupt input: {0}")]
    CorruptInput(String),

    #[error("inference device out of memory")]
    InferenceOom,

    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    /// Another worker won a status CAS race. Not an error in outcome terms.
    #[error("status conflict: {0}")]
    StatusConflict(String),

    /// Row lock contention that exhausted the in-handler re-score budget.
    #[error("profile contention: {0}")]
    ProfileContention(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// Startup-blocking condition (missing model, dimension mismatch).
    #[error("fatal: {0}")]
    Fatal(String),
}

impl WorkError {
    pub fn queue_action(&self) -> QueueAction {
        match self {
            WorkError::TransientIo(_) => QueueAction::Nack,
            WorkError::CorruptInput(_) => QueueAction::Ack,
            // No backoff: the operator remedy is lowering concurrency, and
            // the item itself is fine.
            WorkError::InferenceOom => QueueAction::NackQuick,
            WorkError::DeadlineExceeded(_) => QueueAction::Nack,
            WorkError::StatusConflict(_) => QueueAction::Ack,
            WorkError::ProfileContention(_) => QueueAction::Nack,
            WorkError::Config(_) => QueueAction::Nack,
            WorkError::Fatal(_) => QueueAction::Nack,
        }
    }

    /// Short operator-facing classification persisted as `error_message`.
    pub fn classification(&self) -> &'static str {
        match self {
            WorkError::TransientIo(_) => "transient_io",
            WorkError::CorruptInput(_) => "corrupt",
            WorkError::InferenceOom => "inference_oom",
            WorkError::DeadlineExceeded(_) => "timeout",
            WorkError::StatusConflict(_) => "status_conflict",
            WorkError::ProfileContention(_) => "profile_contention",
            WorkError::Config(_) => "config",
            WorkError::Fatal(_) => "fatal",
        }
    }
}

impl From<std::io::Error> for WorkError {
    fn from(e: std::io::Error) -> Self {
        WorkError::TransientIo(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_input_acks_instead_of_retrying() {
        assert_eq!(
            WorkError::CorruptInput("bad magic".into()).queue_action(),
            QueueAction::Ack
        );
    }

    #[test]
    fn transient_failures_nack() {
        assert_eq!(
            WorkError::TransientIo("queue timeout".into()).queue_action(),
            QueueAction::Nack
        );
        assert_eq!(
            WorkError::DeadlineExceeded(Duration::from_secs(30)).queue_action(),
            QueueAction::Nack
        );
    }

    #[test]
    fn oom_nacks_without_backoff() {
        assert_eq!(WorkError::InferenceOom.queue_action(), QueueAction::NackQuick);
    }

    #[test]
    fn lost_cas_race_acks_silently() {
        assert_eq!(
            WorkError::StatusConflict("already processing".into()).queue_action(),
            QueueAction::Ack
        );
    }
}
