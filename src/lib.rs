pub(crate) mod command;
pub mod config;
pub mod consumer_actor;
pub mod error;
pub mod message_builder;
pub mod multiplexer;
pub mod sub_source;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{MultiplexerConfig, OnRevokeFn, SeekFn, SubscriptionMode};
pub use consumer_actor::{ConsumerHandle, RdKafkaConsumerActor, RebalanceEvent, RebalanceSender};
pub use error::MultiplexerError;
pub use message_builder::MessageBuilder;
pub use multiplexer::Multiplexer;
pub use sub_source::{Control, SubSource};
pub use types::{ConsumerRecord, OffsetMap, Partition};
