// Job-system seam: the work items the observer hands off after an envelope commits.

use serde::{Deserialize, Serialize};

const PROCESS_QUEUE_PREFIX: &str = "__PUSH_PROCESS_JOB__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    DecryptedOk,
    DecryptionError,
    InvalidVersion,
    LegacyMessage,
    UnsupportedDataMessage,
    Noop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptedMessage {
    pub sender: String,
    pub sender_device: u32,
    pub group_id: Option<String>,
    pub timestamp: u64,
    pub server_delivered_timestamp: u64,
    pub content: Vec<u8>,
}

/// Who a failed decrypt came from, as far as we could tell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMetadata {
    pub sender: String,
    pub sender_device: u32,
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    ProcessMessage {
        message: DecryptedMessage,
    },
    RecordMessageError {
        state: MessageState,
        metadata: ErrorMetadata,
        timestamp: u64,
    },
    RefreshPreKeys,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub queue: String,
    pub kind: JobKind,
}

impl Job {
    pub fn new(queue: impl Into<String>, kind: JobKind) -> Self {
        Self {
            queue: queue.into(),
            kind,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self.kind {
            JobKind::ProcessMessage { .. } => "ProcessMessage",
            JobKind::RecordMessageError { .. } => "RecordMessageError",
            JobKind::RefreshPreKeys => "RefreshPreKeys",
        }
    }
}

/// Processing jobs for one conversation share a queue so they run in order.
pub fn process_queue(sender: &str, group_id: Option<&str>) -> String {
    match group_id {
        Some(group) => format!("{PROCESS_QUEUE_PREFIX}{group}"),
        None => format!("{PROCESS_QUEUE_PREFIX}{sender}"),
    }
}

/// Deferred work produced while handling one envelope. Turned into a [`Job`]
/// only after the envelope's transaction has committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUpOperation {
    Enqueue(Job),
    ProcessMessage(DecryptedMessage),
    RecordError {
        state: MessageState,
        metadata: ErrorMetadata,
        timestamp: u64,
    },
}

impl FollowUpOperation {
    pub fn into_job(self) -> Job {
        match self {
            Self::Enqueue(job) => job,
            Self::ProcessMessage(message) => Job::new(
                process_queue(&message.sender, message.group_id.as_deref()),
                JobKind::ProcessMessage { message },
            ),
            Self::RecordError {
                state,
                metadata,
                timestamp,
            } => Job::new(
                process_queue(&metadata.sender, metadata.group_id.as_deref()),
                JobKind::RecordMessageError {
                    state,
                    metadata,
                    timestamp,
                },
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerControl {
    Keep,
    Remove,
}

/// Called after each job on the watched queue finishes.
pub type QueueListener = Box<dyn FnMut() -> ListenerControl + Send>;

pub trait JobQueue: Send + Sync {
    fn enqueue_all(&self, jobs: Vec<Job>);

    fn is_queue_empty(&self, queue: &str) -> bool;

    fn add_queue_listener(&self, queue: &str, listener: QueueListener);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(group_id: Option<&str>) -> ErrorMetadata {
        ErrorMetadata {
            sender: "a1b2".into(),
            sender_device: 2,
            group_id: group_id.map(str::to_string),
        }
    }

    #[test]
    fn error_follow_up_carries_state_and_metadata() {
        let job = FollowUpOperation::RecordError {
            state: MessageState::InvalidVersion,
            metadata: metadata(None),
            timestamp: 77,
        }
        .into_job();
        assert_eq!(job.queue, "__PUSH_PROCESS_JOB__a1b2");
        assert_eq!(job.tag(), "RecordMessageError");
        match job.kind {
            JobKind::RecordMessageError {
                state,
                metadata,
                timestamp,
            } => {
                assert_eq!(state, MessageState::InvalidVersion);
                assert_eq!(metadata.sender_device, 2);
                assert_eq!(timestamp, 77);
            }
            other => panic!("unexpected job: {other:?}"),
        }
    }

    #[test]
    fn group_messages_queue_by_group() {
        let job = FollowUpOperation::RecordError {
            state: MessageState::DecryptionError,
            metadata: metadata(Some("g1")),
            timestamp: 1,
        }
        .into_job();
        assert_eq!(job.queue, "__PUSH_PROCESS_JOB__g1");
    }

    #[test]
    fn job_json_is_tagged() {
        let job = Job::new("q", JobKind::RefreshPreKeys);
        let v = serde_json::to_value(&job).unwrap();
        assert_eq!(v["kind"]["type"], "refresh_pre_keys");
        let back: Job = serde_json::from_value(v).unwrap();
        assert_eq!(back, job);
    }
}
