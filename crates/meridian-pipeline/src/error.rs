use thiserror::Error;

/// Errors from building and driving pipelines.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline queue is full")]
    QueueFull,
    #[error("pipeline queue is closed")]
    QueueClosed,
    #[error("scheduler has shut down")]
    SchedulerGone,
    #[error("invalid graph: {0}")]
    InvalidGraph(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Error returned when a packet cannot be handed to a pipeline worker.
///
/// The rejected packet has already been discarded (its buffer released).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketSendError {
    #[error("queue full")]
    Full,
    #[error("queue closed")]
    Disconnected,
}

impl From<PacketSendError> for PipelineError {
    fn from(e: PacketSendError) -> Self {
        match e {
            PacketSendError::Full => PipelineError::QueueFull,
            PacketSendError::Disconnected => PipelineError::QueueClosed,
        }
    }
}
