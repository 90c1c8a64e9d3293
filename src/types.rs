use std::fmt;

/// A Kafka `(topic, partition-id)` identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    pub topic: String,
    pub partition: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// A single unprocessed record as delivered by the consumer actor, prior to
/// `MessageBuilder` transformation.
#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    pub partition: Partition,
    pub offset: i64,
    pub timestamp_ms: Option<i64>,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
}

/// Offsets to seek to, keyed by partition, as returned by `get_offsets_on_assign`.
pub type OffsetMap = std::collections::HashMap<Partition, i64>;
