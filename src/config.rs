use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::error::MultiplexerError;
use crate::types::{OffsetMap, Partition};

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    pub kafka_topic_metadata_refresh_interval_ms: Option<u32>,
    pub kafka_socket_timeout_ms: Option<u32>,   // Socket operation timeout
    pub kafka_metadata_max_age_ms: Option<u32>, // Metadata refresh interval
}

#[derive(Envconfig, Clone)]
pub struct ConsumerConfig {
    pub kafka_consumer_group: String,
    pub kafka_consumer_topic: String,

    // We default to "earliest" for this, but if you're bringing up a new service, you probably want "latest"
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    // Note: consumers used in a transactional fashion should disable auto offset commits,
    // as their offsets should be committed via the transactional producer. All consumers
    // disable auto offset /storing/.
    pub kafka_consumer_auto_commit: bool,

    // expose override config for interval (in milliseconds) between
    // Kafka offset commit attempts
    #[envconfig(default = "5000")]
    pub kafka_consumer_auto_commit_interval_ms: i32,
}

impl ConsumerConfig {
    /// Because the consumer config is so application specific, we
    /// can't set good defaults in the derive macro, so we expose a way
    /// for users to set them here before init'ing their main config struct
    pub fn set_defaults(consumer_group: &str, consumer_topic: &str, auto_commit: bool) {
        if std::env::var("KAFKA_CONSUMER_GROUP").is_err() {
            std::env::set_var("KAFKA_CONSUMER_GROUP", consumer_group);
        };
        if std::env::var("KAFKA_CONSUMER_TOPIC").is_err() {
            std::env::set_var("KAFKA_CONSUMER_TOPIC", consumer_topic);
        };

        if std::env::var("KAFKA_CONSUMER_AUTO_COMMIT").is_err() {
            std::env::set_var("KAFKA_CONSUMER_AUTO_COMMIT", auto_commit.to_string());
        }
    }
}

/// Builds the `rdkafka` client config the same way the rest of this
/// workspace's consumers do: bootstrap servers, statistics interval, group
/// id, disabled auto offset store, optional TLS.
pub fn build_client_config(kafka: &KafkaConfig, consumer_group: &ConsumerConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &kafka.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("group.id", &consumer_group.kafka_consumer_group)
        .set("enable.auto.offset.store", "false")
        .set(
            "auto.offset.reset",
            &consumer_group.kafka_consumer_offset_reset,
        );

    if let Some(ms) = kafka.kafka_socket_timeout_ms {
        client_config.set("socket.timeout.ms", ms.to_string());
    }
    if let Some(ms) = kafka.kafka_metadata_max_age_ms {
        client_config.set("metadata.max.age.ms", ms.to_string());
    }
    if let Some(ms) = kafka.kafka_topic_metadata_refresh_interval_ms {
        client_config.set("topic.metadata.refresh.interval.ms", ms.to_string());
    }
    if kafka.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    }

    client_config
}

/// How the Multiplexer subscribes to topics at startup (§4.1.1, §6).
#[derive(Clone)]
pub enum SubscriptionMode {
    Topics(Vec<String>),
    Pattern(String),
}

/// `getOffsetsOnAssign`: invoked on newly-assigned partitions before they're
/// admitted. `None` means no seek-on-assign — partitions are admitted as-is.
pub type SeekFn = Arc<
    dyn Fn(
            std::collections::HashSet<Partition>,
        )
            -> futures::future::BoxFuture<'static, Result<OffsetMap, MultiplexerError>>
        + Send
        + Sync,
>;

/// `onRevoke`: fired once the grace window for a revoked batch elapses.
pub type OnRevokeFn = Arc<dyn Fn(std::collections::HashSet<Partition>) + Send + Sync>;

/// The multiplexer-specific configuration surface from §6. Broker connection
/// settings are kept in the existing `KafkaConfig`/`ConsumerConfig`; this
/// struct is the part that's specific to the partitioned-multiplexer
/// protocol and so can't sensibly be `envconfig`-derived (the seek and
/// revoke hooks are closures supplied by the embedding program).
#[derive(Clone)]
pub struct MultiplexerConfig {
    pub subscription: SubscriptionMode,
    pub get_offsets_on_assign: Option<SeekFn>,
    pub on_revoke: Option<OnRevokeFn>,
    pub wait_close_partition: Duration,
    pub consumer: KafkaConfig,
    pub consumer_group: ConsumerConfig,
}

/// The 10s seek-ask timeout is a literal hard-coded design choice (§9), not
/// surfaced as configuration.
pub const SEEK_TIMEOUT: Duration = Duration::from_secs(10);
