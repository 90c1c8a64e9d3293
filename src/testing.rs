//! An entirely in-memory `ConsumerHandle` used by this crate's own tests and
//! by the scenario suite under `tests/`. It implements the exact message
//! contract real `RdKafkaConsumerActor` does, so the Multiplexer/SubSource
//! state machines can be exercised deterministically without a broker.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex as AsyncMutex};

use crate::consumer_actor::{ConsumerHandle, RebalanceEvent, RebalanceSender};
use crate::error::MultiplexerError;
use crate::types::{ConsumerRecord, OffsetMap, Partition};

pub fn make_record(tp: &Partition, offset: i64, payload: &str) -> ConsumerRecord {
    ConsumerRecord {
        partition: tp.clone(),
        offset,
        timestamp_ms: None,
        key: None,
        payload: Some(payload.as_bytes().to_vec()),
    }
}

#[derive(Clone)]
pub enum SeekBehavior {
    Succeed,
    Fail(String),
    /// Never replies; used to exercise the 10s seek-ask timeout.
    Hang,
}

struct Inner {
    rebalance_tx: Option<RebalanceSender>,
    partitions: HashMap<Partition, VecDeque<ConsumerRecord>>,
    seek_calls: Vec<OffsetMap>,
    seek_behavior: SeekBehavior,
}

pub struct FakeConsumerActor {
    inner: AsyncMutex<Inner>,
    terminated_tx: watch::Sender<bool>,
    terminated_rx: watch::Receiver<bool>,
    version_tx: watch::Sender<u64>,
}

impl FakeConsumerActor {
    pub fn new() -> Arc<Self> {
        let (terminated_tx, terminated_rx) = watch::channel(false);
        let (version_tx, _) = watch::channel(0);
        Arc::new(Self {
            inner: AsyncMutex::new(Inner {
                rebalance_tx: None,
                partitions: HashMap::new(),
                seek_calls: Vec::new(),
                seek_behavior: SeekBehavior::Succeed,
            }),
            terminated_tx,
            terminated_rx,
            version_tx,
        })
    }

    pub async fn push_records(&self, tp: &Partition, records: Vec<ConsumerRecord>) {
        {
            let mut inner = self.inner.lock().await;
            inner.partitions.entry(tp.clone()).or_default().extend(records);
        }
        self.version_tx.send_modify(|v| *v += 1);
    }

    pub async fn set_seek_behavior(&self, behavior: SeekBehavior) {
        self.inner.lock().await.seek_behavior = behavior;
    }

    pub async fn seek_calls(&self) -> Vec<OffsetMap> {
        self.inner.lock().await.seek_calls.clone()
    }

    pub async fn emit_assigned(&self, partitions: impl IntoIterator<Item = Partition>) {
        let inner = self.inner.lock().await;
        if let Some(tx) = &inner.rebalance_tx {
            let _ = tx.send(RebalanceEvent::Assigned(partitions.into_iter().collect()));
        }
    }

    pub async fn emit_revoked(&self, partitions: impl IntoIterator<Item = Partition>) {
        let inner = self.inner.lock().await;
        if let Some(tx) = &inner.rebalance_tx {
            let _ = tx.send(RebalanceEvent::Revoked(partitions.into_iter().collect()));
        }
    }

    pub fn force_terminate(&self) {
        let _ = self.terminated_tx.send(true);
    }
}

#[async_trait]
impl ConsumerHandle for FakeConsumerActor {
    async fn subscribe(
        &self,
        _topics: Vec<String>,
        rebalance: RebalanceSender,
    ) -> Result<(), MultiplexerError> {
        self.inner.lock().await.rebalance_tx = Some(rebalance);
        Ok(())
    }

    async fn subscribe_pattern(
        &self,
        _pattern: String,
        rebalance: RebalanceSender,
    ) -> Result<(), MultiplexerError> {
        self.inner.lock().await.rebalance_tx = Some(rebalance);
        Ok(())
    }

    async fn seek(&self, offsets: OffsetMap) -> Result<(), MultiplexerError> {
        enum Action {
            Succeed,
            Fail(String),
            Hang,
        }
        let action = {
            let mut inner = self.inner.lock().await;
            inner.seek_calls.push(offsets.clone());
            match &inner.seek_behavior {
                SeekBehavior::Succeed => Action::Succeed,
                SeekBehavior::Fail(reason) => Action::Fail(reason.clone()),
                SeekBehavior::Hang => Action::Hang,
            }
        };
        match action {
            Action::Succeed => Ok(()),
            Action::Fail(reason) => Err(MultiplexerError::consumer_failed(reason)),
            Action::Hang => std::future::pending::<Result<(), MultiplexerError>>().await,
        }
    }

    async fn request_messages(&self, tp: Partition) -> Result<Vec<ConsumerRecord>, MultiplexerError> {
        loop {
            let mut version_rx = self.version_tx.subscribe();
            {
                let mut inner = self.inner.lock().await;
                if let Some(q) = inner.partitions.get_mut(&tp) {
                    if !q.is_empty() {
                        return Ok(q.drain(..).collect());
                    }
                }
            }
            if *self.terminated_rx.borrow() {
                return Err(MultiplexerError::consumer_failed(
                    "fake consumer actor terminated",
                ));
            }
            let mut term_rx = self.terminated_rx.clone();
            tokio::select! {
                _ = version_rx.changed() => {}
                _ = term_rx.changed() => {}
            }
        }
    }

    async fn stop(&self) {
        let _ = self.terminated_tx.send(true);
    }

    fn terminated(&self) -> watch::Receiver<bool> {
        self.terminated_rx.clone()
    }
}
