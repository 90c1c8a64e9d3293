use crate::types::Partition;

/// Errors surfaced by the multiplexer and its substreams.
///
/// `SeekFailed` is a subclass of `ConsumerFailed` in spirit (§7): both cause
/// the owning stage to fail and every live SubSource to fail with it, but
/// `SeekFailed` additionally carries the partition set that was being
/// admitted so callers can log which assignment triggered it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MultiplexerError {
    #[error("consumer actor failed: {reason}")]
    ConsumerFailed { reason: String },

    #[error("seek failed for partitions {partitions:?}: {reason}")]
    SeekFailed {
        partitions: Vec<Partition>,
        reason: String,
    },
}

impl MultiplexerError {
    pub fn consumer_failed(reason: impl Into<String>) -> Self {
        Self::ConsumerFailed {
            reason: reason.into(),
        }
    }

    pub fn seek_failed(partitions: Vec<Partition>, reason: impl Into<String>) -> Self {
        Self::SeekFailed {
            partitions,
            reason: reason.into(),
        }
    }

    /// True for every variant: a `SeekFailed` is, per the design, just a
    /// `ConsumerFailed` with extra diagnostics.
    pub fn is_consumer_failed(&self) -> bool {
        true
    }
}

impl From<rdkafka::error::KafkaError> for MultiplexerError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        MultiplexerError::consumer_failed(err.to_string())
    }
}
