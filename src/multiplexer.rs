use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info};

use crate::command::Command;
use crate::config::{MultiplexerConfig, SubscriptionMode, SEEK_TIMEOUT};
use crate::consumer_actor::{self, ConsumerHandle, RebalanceEvent};
use crate::error::MultiplexerError;
use crate::message_builder::MessageBuilder;
use crate::sub_source::{self, Control, SubSource};
use crate::types::Partition;

const DOWNSTREAM_CAPACITY: usize = 16;
const SUBSOURCE_BUFFER_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Stopping,
    ShuttingDown,
    Terminated,
}

/// The root stage: a single-output stream of `(Partition, SubSource)` pairs
/// (§4.1). `Multiplexer` is the handle a caller keeps for lifecycle control;
/// the element stream itself is returned separately from `start`.
pub struct Multiplexer {
    cmd_tx: mpsc::UnboundedSender<Command>,
    driver: JoinHandle<()>,
    error_slot: Arc<StdMutex<Option<MultiplexerError>>>,
}

impl Multiplexer {
    /// The normal entry point (§4.1.1, §9 "the Multiplexer creates the
    /// ConsumerActor and is its sole lifecycle owner"): builds the real
    /// `RdKafkaConsumerActor` from `config.consumer`/`config.consumer_group`
    /// and starts the stage against it. Use `start` directly only to inject
    /// a different `ConsumerHandle`, e.g. `testing::FakeConsumerActor`.
    pub fn connect<B>(
        config: MultiplexerConfig,
        message_builder: Arc<B>,
    ) -> Result<(Self, ReceiverStream<(Partition, SubSource<B::Msg>)>), rdkafka::error::KafkaError>
    where
        B: MessageBuilder,
    {
        let consumer_actor = consumer_actor::start(&config.consumer, &config.consumer_group)?;
        Ok(Self::start(config, consumer_actor, message_builder))
    }

    /// Start the stage against an already-constructed `ConsumerHandle`
    /// (real or fake). `Multiplexer::connect` is the usual way in; this is
    /// the seam tests use to inject `testing::FakeConsumerActor`.
    pub fn start<B>(
        config: MultiplexerConfig,
        consumer_actor: Arc<dyn ConsumerHandle>,
        message_builder: Arc<B>,
    ) -> (Self, ReceiverStream<(Partition, SubSource<B::Msg>)>)
    where
        B: MessageBuilder,
    {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::channel(DOWNSTREAM_CAPACITY);
        let error_slot = Arc::new(StdMutex::new(None));

        // Rebalance listener bridge: forwards assigned/revoked batches onto
        // the driver's own command queue as plain commands.
        let (rebalance_tx, mut rebalance_rx) = mpsc::unbounded_channel::<RebalanceEvent>();
        let rebalance_cmd_tx = cmd_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = rebalance_rx.recv().await {
                let cmd = match event {
                    RebalanceEvent::Assigned(p) => Command::AssignPartitions(p),
                    RebalanceEvent::Revoked(p) => Command::RevokePartitions(p),
                };
                if rebalance_cmd_tx.send(cmd).is_err() {
                    break;
                }
            }
        });

        // Termination watcher: registered once at startup, independent of
        // whichever phase the stage later moves through (§4.1.1, §4.1.6).
        let mut terminated_rx = consumer_actor.terminated();
        let terminated_cmd_tx = cmd_tx.clone();
        tokio::spawn(async move {
            loop {
                if *terminated_rx.borrow() {
                    let _ = terminated_cmd_tx.send(Command::ConsumerTerminated);
                    break;
                }
                if terminated_rx.changed().await.is_err() {
                    break;
                }
            }
        });

        let driver_error_slot = Arc::clone(&error_slot);
        let driver_cmd_tx = cmd_tx.clone();
        let driver = tokio::spawn(async move {
            let mut state = State {
                config,
                consumer_actor,
                message_builder,
                cmd_tx: driver_cmd_tx,
                out_tx: Some(out_tx),
                error_slot: driver_error_slot,
                pending_partitions: HashSet::new(),
                partitions_in_startup: HashSet::new(),
                sub_sources: HashMap::new(),
                partitions_to_revoke: HashSet::new(),
                revoke_generation: 0,
                phase: Phase::Running,
                pull_waiter_pending: false,
            };
            state.startup(rebalance_tx).await;
            state.run(cmd_rx).await;
        });

        (
            Multiplexer {
                cmd_tx,
                driver,
                error_slot,
            },
            ReceiverStream::new(out_rx),
        )
    }

    /// Upstream "finish when in-flight work ends": cooperative drain.
    pub fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop);
    }

    /// Downstream cancel or fatal: force every SubSource to stop.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }

    /// Wait for the driver task to fully terminate (both shutdown modes end
    /// here once the ConsumerActor has acknowledged termination).
    pub async fn joined(self) {
        let _ = self.driver.await;
    }

    /// The failure that caused the stage to terminate, if any.
    pub fn last_error(&self) -> Option<MultiplexerError> {
        self.error_slot.lock().unwrap().clone()
    }
}

struct State<B: MessageBuilder> {
    config: MultiplexerConfig,
    consumer_actor: Arc<dyn ConsumerHandle>,
    message_builder: Arc<B>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    out_tx: Option<mpsc::Sender<(Partition, SubSource<B::Msg>)>>,
    error_slot: Arc<StdMutex<Option<MultiplexerError>>>,

    pending_partitions: HashSet<Partition>,
    partitions_in_startup: HashSet<Partition>,
    sub_sources: HashMap<Partition, Control>,
    partitions_to_revoke: HashSet<Partition>,
    revoke_generation: u64,
    phase: Phase,
    /// Set while a background task is waiting for downstream capacity to
    /// free up; guards against spawning a redundant waiter per pending
    /// partition (§9).
    pull_waiter_pending: bool,
}

impl<B: MessageBuilder> State<B> {
    async fn startup(&mut self, rebalance_tx: mpsc::UnboundedSender<RebalanceEvent>) {
        let result = match self.config.subscription.clone() {
            SubscriptionMode::Topics(topics) => {
                self.consumer_actor.subscribe(topics, rebalance_tx).await
            }
            SubscriptionMode::Pattern(pattern) => {
                self.consumer_actor
                    .subscribe_pattern(pattern, rebalance_tx)
                    .await
            }
        };
        if let Err(err) = result {
            self.fail(err).await;
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            let closed_watch = async {
                match &self.out_tx {
                    Some(tx) => tx.closed().await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle(cmd).await,
                        None => break,
                    }
                }
                _ = closed_watch, if self.out_tx.is_some() => {
                    debug!("downstream cancelled the multiplexer");
                    self.force_shutdown().await;
                }
            }

            if self.phase == Phase::Terminated {
                break;
            }
        }

        // postStop: best-effort Stop, idempotent if already sent.
        self.consumer_actor.stop().await;
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::AssignPartitions(assigned) => self.handle_assigned(assigned).await,
            Command::RevokePartitions(revoked) => self.handle_revoked(revoked),
            Command::SeekDone { partitions, result } => {
                self.handle_seek_done(partitions, result).await
            }
            Command::SubStarted { tp, control } => self.handle_sub_started(tp, control),
            Command::SubCancelled { tp } => self.handle_sub_cancelled(tp).await,
            Command::RevokeTimerFired { generation } => {
                self.handle_revoke_timer_fired(generation).await
            }
            Command::ConsumerTerminated => self.handle_consumer_terminated().await,
            Command::Pull => {
                self.pull_waiter_pending = false;
                self.run_emit_loop().await;
            }
            Command::Stop => self.handle_stop().await,
            Command::Shutdown => self.force_shutdown().await,
        }
    }

    /// §4.1.2
    async fn handle_assigned(&mut self, assigned: HashSet<Partition>) {
        if self.phase != Phase::Running {
            return;
        }

        let partitions: HashSet<Partition> = assigned
            .difference(&self.partitions_to_revoke)
            .cloned()
            .collect();
        for tp in &assigned {
            self.partitions_to_revoke.remove(tp);
        }

        info!(?partitions, "partitions assigned");

        match self.config.get_offsets_on_assign.clone() {
            None => self.admit(partitions).await,
            Some(seek_fn) => {
                let consumer_actor = Arc::clone(&self.consumer_actor);
                let cmd_tx = self.cmd_tx.clone();
                tokio::spawn(async move {
                    let result = Self::run_seek(consumer_actor, &seek_fn, partitions.clone()).await;
                    let _ = cmd_tx.send(Command::SeekDone {
                        partitions,
                        result,
                    });
                });
            }
        }
    }

    async fn run_seek(
        consumer_actor: Arc<dyn ConsumerHandle>,
        seek_fn: &crate::config::SeekFn,
        partitions: HashSet<Partition>,
    ) -> Result<(), MultiplexerError> {
        let offsets = seek_fn(partitions.clone()).await?;
        match tokio::time::timeout(SEEK_TIMEOUT, consumer_actor.seek(offsets)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(MultiplexerError::seek_failed(
                partitions.into_iter().collect(),
                "seek ask exceeded 10s timeout",
            )),
        }
    }

    async fn handle_seek_done(
        &mut self,
        partitions: HashSet<Partition>,
        result: Result<(), MultiplexerError>,
    ) {
        if self.phase != Phase::Running {
            return;
        }
        match result {
            Ok(()) => self.admit(partitions).await,
            Err(err) => {
                error!(error = %err, ?partitions, "seek-on-assign failed");
                self.fail(err).await;
            }
        }
    }

    async fn admit(&mut self, partitions: HashSet<Partition>) {
        for tp in partitions {
            if !self.partitions_in_startup.contains(&tp) && !self.sub_sources.contains_key(&tp) {
                self.pending_partitions.insert(tp);
            }
        }
        self.run_emit_loop().await;
    }

    /// §4.1.3
    fn handle_revoked(&mut self, revoked: HashSet<Partition>) {
        if self.phase != Phase::Running {
            return;
        }
        info!(?revoked, "partitions revoked, starting grace window");
        self.revoke_generation += 1;
        let generation = self.revoke_generation;
        self.partitions_to_revoke.extend(revoked);

        let wait = self.config.wait_close_partition;
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let _ = cmd_tx.send(Command::RevokeTimerFired { generation });
        });
    }

    async fn handle_revoke_timer_fired(&mut self, generation: u64) {
        // Race-free against a newer overlapping revoke: a stale timer whose
        // generation no longer matches is a no-op (§9).
        if generation != self.revoke_generation {
            return;
        }
        let revoked = std::mem::take(&mut self.partitions_to_revoke);
        if revoked.is_empty() {
            return;
        }

        if let Some(on_revoke) = self.config.on_revoke.clone() {
            on_revoke(revoked.clone());
        }

        for tp in &revoked {
            self.pending_partitions.remove(tp);
            self.partitions_in_startup.remove(tp);
        }

        let mut controls = Vec::new();
        for tp in &revoked {
            if let Some(control) = self.sub_sources.remove(tp) {
                control.shutdown();
                controls.push(control);
            }
        }
        for control in controls {
            tokio::spawn(async move { control.join().await });
        }

        if self.phase == Phase::Stopping
            && self.sub_sources.is_empty()
            && self.partitions_in_startup.is_empty()
        {
            self.finalize_drain().await;
        }
    }

    /// §4.1.4
    fn handle_sub_started(&mut self, tp: Partition, control: Control) {
        if !self.partitions_in_startup.remove(&tp) {
            // Revoked while starting: the grace timer already fired and
            // couldn't reach a control handle it didn't have yet.
            debug!(%tp, "subsource started after being revoked, shutting down immediately");
            control.shutdown();
            tokio::spawn(async move { control.join().await });
        } else {
            self.sub_sources.insert(tp, control);
        }
    }

    /// §4.1.4
    async fn handle_sub_cancelled(&mut self, tp: Partition) {
        if self.sub_sources.remove(&tp).is_none() {
            // Already removed (e.g. by a revoke-timer forced shutdown).
            return;
        }
        self.partitions_in_startup.remove(&tp);

        match self.phase {
            Phase::Running => {
                self.pending_partitions.insert(tp);
                self.run_emit_loop().await;
            }
            Phase::Stopping => {
                if self.sub_sources.is_empty() && self.partitions_in_startup.is_empty() {
                    self.finalize_drain().await;
                }
            }
            Phase::ShuttingDown | Phase::Terminated => {}
        }
    }

    async fn handle_consumer_terminated(&mut self) {
        match self.phase {
            Phase::Running => {
                error!("consumer actor terminated unexpectedly");
                self.fail(MultiplexerError::consumer_failed(
                    "consumer actor terminated",
                ))
                .await;
                self.phase = Phase::Terminated;
            }
            Phase::Stopping | Phase::ShuttingDown => {
                self.phase = Phase::Terminated;
            }
            Phase::Terminated => {}
        }
    }

    /// §4.1.5. Backpressure is never awaited inline here: a full downstream
    /// channel hands off to a one-shot background waiter that wakes the
    /// driver with `Command::Pull` once capacity frees up, so a slow or
    /// absent reader can never stall processing of other commands (assign,
    /// revoke-timer, sub lifecycle) behind this loop.
    async fn run_emit_loop(&mut self) {
        while self.phase == Phase::Running {
            let Some(tp) = self.pending_partitions.iter().next().cloned() else {
                break;
            };

            let Some(tx) = self.out_tx.clone() else {
                break;
            };
            let permit = match tx.try_reserve_owned() {
                Ok(permit) => permit,
                Err(TrySendError::Full(tx)) => {
                    if !self.pull_waiter_pending {
                        self.pull_waiter_pending = true;
                        let cmd_tx = self.cmd_tx.clone();
                        tokio::spawn(async move {
                            // Claim-and-release: we only need the wakeup,
                            // not this particular permit — the driver
                            // re-reserves for itself once woken.
                            if let Ok(permit) = tx.reserve_owned().await {
                                drop(permit);
                            }
                            let _ = cmd_tx.send(Command::Pull);
                        });
                    }
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    self.force_shutdown().await;
                    break;
                }
            };

            self.pending_partitions.remove(&tp);
            self.partitions_in_startup.insert(tp.clone());

            let (source, control) = sub_source::spawn(
                tp.clone(),
                Arc::clone(&self.consumer_actor),
                Arc::clone(&self.message_builder),
                self.cmd_tx.clone(),
                SUBSOURCE_BUFFER_CAPACITY,
            );
            permit.send((tp.clone(), source));
            let _ = self.cmd_tx.send(Command::SubStarted { tp, control });
        }
    }

    /// §4.1.6, "Stop"
    async fn handle_stop(&mut self) {
        if self.phase != Phase::Running {
            return;
        }
        info!("stop requested, draining cooperatively");
        self.phase = Phase::Stopping;
        for control in self.sub_sources.values() {
            control.stop();
        }
        self.out_tx = None;

        if self.sub_sources.is_empty() && self.partitions_in_startup.is_empty() {
            self.finalize_drain().await;
        }
    }

    /// Every running SubSource has been cooperatively drained; hand off to
    /// the same finalization the forced path uses.
    async fn finalize_drain(&mut self) {
        self.consumer_actor.stop().await;
    }

    /// §4.1.6, "Shutdown" — also used for fatal failure.
    async fn force_shutdown(&mut self) {
        if self.phase == Phase::Terminated {
            return;
        }
        info!("forced shutdown");
        self.phase = Phase::ShuttingDown;
        self.out_tx = None;

        let controls: Vec<Control> = self.sub_sources.drain().map(|(_, c)| c).collect();
        self.partitions_in_startup.clear();
        self.pending_partitions.clear();
        self.partitions_to_revoke.clear();

        for control in &controls {
            control.shutdown();
        }
        // Resolved Open Question (§9): wait for every SubSource to finish
        // before sending Stop to the ConsumerActor.
        for control in controls {
            control.join().await;
        }
        self.consumer_actor.stop().await;
    }

    async fn fail(&mut self, err: MultiplexerError) {
        *self.error_slot.lock().unwrap() = Some(err);
        self.force_shutdown().await;
    }
}
