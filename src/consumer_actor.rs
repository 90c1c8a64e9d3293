use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use rdkafka::consumer::{Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::{ClientConfig, ClientContext, Message, Offset, TopicPartitionList};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, error, info};

use crate::config::{build_client_config, ConsumerConfig, KafkaConfig};
use crate::error::MultiplexerError;
use crate::types::{ConsumerRecord, OffsetMap, Partition};

/// Assigned/revoked partition batches as delivered by the broker's rebalance
/// protocol. Forwarded verbatim onto whichever channel the Multiplexer
/// registered at subscribe time.
#[derive(Debug, Clone)]
pub enum RebalanceEvent {
    Assigned(HashSet<Partition>),
    Revoked(HashSet<Partition>),
}

pub type RebalanceSender = mpsc::UnboundedSender<RebalanceEvent>;

/// The external message contract of §6: the only surface the Multiplexer and
/// its SubSources are allowed to depend on. `RdKafkaConsumerActor` backs it
/// with a real broker client; `testing::FakeConsumerActor` backs it entirely
/// in memory for the state-machine tests.
#[async_trait]
pub trait ConsumerHandle: Send + Sync + 'static {
    async fn subscribe(
        &self,
        topics: Vec<String>,
        rebalance: RebalanceSender,
    ) -> Result<(), MultiplexerError>;

    async fn subscribe_pattern(
        &self,
        pattern: String,
        rebalance: RebalanceSender,
    ) -> Result<(), MultiplexerError>;

    async fn seek(&self, offsets: OffsetMap) -> Result<(), MultiplexerError>;

    async fn request_messages(&self, tp: Partition) -> Result<Vec<ConsumerRecord>, MultiplexerError>;

    /// Fire-and-forget: the actor terminates once drained.
    async fn stop(&self);

    /// A `watch` that flips to `true` exactly once, when the actor has
    /// terminated (fatally or after a `Stop` drain). Cloned independently by
    /// the Multiplexer and every live SubSource.
    fn terminated(&self) -> watch::Receiver<bool>;
}

fn to_partition_set(tpl: &TopicPartitionList) -> HashSet<Partition> {
    tpl.elements()
        .iter()
        .map(|e| Partition::new(e.topic(), e.partition()))
        .collect()
}

struct MultiplexerContext {
    rebalance_tx: StdMutex<Option<RebalanceSender>>,
}

impl ClientContext for MultiplexerContext {}

impl ConsumerContext for MultiplexerContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(tpl) = rebalance {
            let revoked = to_partition_set(tpl);
            debug!(?revoked, "pre_rebalance: revoke");
            if let Some(tx) = self.rebalance_tx.lock().unwrap().as_ref() {
                let _ = tx.send(RebalanceEvent::Revoked(revoked));
            }
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(tpl) = rebalance {
            let assigned = to_partition_set(tpl);
            debug!(?assigned, "post_rebalance: assign");
            if let Some(tx) = self.rebalance_tx.lock().unwrap().as_ref() {
                let _ = tx.send(RebalanceEvent::Assigned(assigned));
            }
        }
    }
}

type PartitionQueue = Arc<AsyncMutex<mpsc::UnboundedReceiver<ConsumerRecord>>>;

/// A real Kafka-backed `ConsumerHandle`. Owns a single `StreamConsumer` and a
/// background task that demultiplexes polled records by partition, so each
/// `request_messages(tp)` call only ever sees records for `tp` — the routing
/// a real partitioned-consumer client would otherwise do on our behalf.
pub struct RdKafkaConsumerActor {
    consumer: Arc<StreamConsumer<MultiplexerContext>>,
    routes: StdMutex<HashMap<Partition, PartitionQueue>>,
    route_senders: StdMutex<HashMap<Partition, mpsc::UnboundedSender<ConsumerRecord>>>,
    terminated_tx: watch::Sender<bool>,
    terminated_rx: watch::Receiver<bool>,
}

impl RdKafkaConsumerActor {
    pub fn new(mut client_config: ClientConfig) -> Result<Arc<Self>, KafkaError> {
        let context = MultiplexerContext {
            rebalance_tx: StdMutex::new(None),
        };
        let consumer: StreamConsumer<MultiplexerContext> =
            client_config.set("enable.auto.commit", "false").create_with_context(context)?;
        let (terminated_tx, terminated_rx) = watch::channel(false);

        Ok(Arc::new(Self {
            consumer: Arc::new(consumer),
            routes: StdMutex::new(HashMap::new()),
            route_senders: StdMutex::new(HashMap::new()),
            terminated_tx,
            terminated_rx,
        }))
    }

    fn queue_for(&self, tp: &Partition) -> PartitionQueue {
        if let Some(q) = self.routes.lock().unwrap().get(tp) {
            return q.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(AsyncMutex::new(rx));
        self.routes.lock().unwrap().insert(tp.clone(), queue.clone());
        self.route_senders.lock().unwrap().insert(tp.clone(), tx);
        queue
    }

    fn spawn_poll_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match this.consumer.recv().await {
                    Ok(msg) => {
                        let tp = Partition::new(msg.topic(), msg.partition());
                        let record = ConsumerRecord {
                            partition: tp.clone(),
                            offset: msg.offset(),
                            timestamp_ms: msg.timestamp().to_millis(),
                            key: msg.key().map(|k| k.to_vec()),
                            payload: msg.payload().map(|p| p.to_vec()),
                        };
                        let sender = this.route_senders.lock().unwrap().get(&tp).cloned();
                        match sender {
                            Some(tx) => {
                                let _ = tx.send(record);
                            }
                            None => {
                                // No SubSource has issued a RequestMessages for this
                                // partition yet; drop rather than block the poll loop.
                                debug!(%tp, "no route registered, dropping polled record");
                            }
                        }
                    }
                    Err(err) => {
                        error!(error = %err, "consumer actor poll failed, terminating");
                        let _ = this.terminated_tx.send(true);
                        break;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl ConsumerHandle for RdKafkaConsumerActor {
    async fn subscribe(
        &self,
        topics: Vec<String>,
        rebalance: RebalanceSender,
    ) -> Result<(), MultiplexerError> {
        *self
            .consumer
            .context()
            .rebalance_tx
            .lock()
            .unwrap() = Some(rebalance);
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topic_refs)?;
        info!(?topics, "subscribed");
        Ok(())
    }

    async fn subscribe_pattern(
        &self,
        pattern: String,
        rebalance: RebalanceSender,
    ) -> Result<(), MultiplexerError> {
        *self
            .consumer
            .context()
            .rebalance_tx
            .lock()
            .unwrap() = Some(rebalance);
        let topic = format!("^{pattern}");
        self.consumer.subscribe(&[topic.as_str()])?;
        info!(%pattern, "subscribed to pattern");
        Ok(())
    }

    async fn seek(&self, offsets: OffsetMap) -> Result<(), MultiplexerError> {
        for (tp, offset) in offsets {
            self.consumer
                .seek(&tp.topic, tp.partition, Offset::Offset(offset), None)
                .map_err(|e| {
                    MultiplexerError::seek_failed(vec![tp.clone()], e.to_string())
                })?;
        }
        Ok(())
    }

    async fn request_messages(&self, tp: Partition) -> Result<Vec<ConsumerRecord>, MultiplexerError> {
        let queue = self.queue_for(&tp);
        let mut rx = queue.lock().await;
        let first = rx.recv().await.ok_or_else(|| {
            MultiplexerError::consumer_failed("consumer actor's poll loop has exited")
        })?;
        let mut records = vec![first];
        while let Ok(next) = rx.try_recv() {
            records.push(next);
        }
        Ok(records)
    }

    async fn stop(&self) {
        // Fire-and-forget: stop consuming, best-effort unsubscribe.
        self.consumer.unsubscribe();
        let _ = self.terminated_tx.send(true);
    }

    fn terminated(&self) -> watch::Receiver<bool> {
        self.terminated_rx.clone()
    }
}

/// Build the client config from this crate's `KafkaConfig`/`ConsumerConfig`
/// and start the background poll loop.
pub fn start(
    kafka: &KafkaConfig,
    consumer_group: &ConsumerConfig,
) -> Result<Arc<RdKafkaConsumerActor>, KafkaError> {
    let client_config = build_client_config(kafka, consumer_group);
    let actor = RdKafkaConsumerActor::new(client_config)?;
    actor.spawn_poll_loop();
    Ok(actor)
}
