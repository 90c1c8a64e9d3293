use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::command::Command;
use crate::consumer_actor::ConsumerHandle;
use crate::error::MultiplexerError;
use crate::message_builder::MessageBuilder;
use crate::types::{ConsumerRecord, Partition};

/// The parent's non-owning handle on a running SubSource: `stop()` for a
/// cooperative drain, `shutdown()` to force it immediately. Never cloned;
/// only the Multiplexer ever holds one (§9, "avoid a cyclic strong
/// reference between parent and child").
pub struct Control {
    tp: Partition,
    shutdown_token: CancellationToken,
    stop_flag: Arc<AtomicBool>,
    join_handle: JoinHandle<()>,
}

impl Control {
    pub fn partition(&self) -> &Partition {
        &self.tp
    }

    /// Cooperative drain: finish the in-flight request and any buffered
    /// records, then stop issuing new `RequestMessages`.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }

    /// Force an immediate stop, abandoning any buffered or in-flight work.
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }

    /// Wait for the SubSource's task to actually exit. Used by the
    /// Multiplexer's forced-shutdown path, which must wait for every
    /// SubSource to finish before sending `Stop` to the ConsumerActor (§9).
    pub async fn join(self) {
        let _ = self.join_handle.await;
    }
}

/// A per-partition stream of transformed messages. Produced by the
/// Multiplexer, consumed independently of every other SubSource.
pub struct SubSource<Msg> {
    tp: Partition,
    rx: ReceiverStream<Result<Msg, MultiplexerError>>,
}

impl<Msg> SubSource<Msg> {
    pub fn partition(&self) -> &Partition {
        &self.tp
    }
}

impl<Msg> Stream for SubSource<Msg> {
    type Item = Result<Msg, MultiplexerError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.rx).poll_next(cx)
    }
}

/// Spawn a SubSource for `tp`. The returned `SubSource` is the stream end
/// downstream owns; the returned `Control` is the handle the Multiplexer
/// keeps. `buffer_capacity` bounds the output channel, which is how
/// downstream demand becomes real backpressure against the pump loop.
pub(crate) fn spawn<B>(
    tp: Partition,
    consumer_actor: Arc<dyn ConsumerHandle>,
    message_builder: Arc<B>,
    parent_tx: mpsc::UnboundedSender<Command>,
    buffer_capacity: usize,
) -> (SubSource<B::Msg>, Control)
where
    B: MessageBuilder,
{
    let (tx, rx) = mpsc::channel(buffer_capacity.max(1));
    let shutdown_token = CancellationToken::new();
    let stop_flag = Arc::new(AtomicBool::new(false));

    let task_tp = tp.clone();
    let task_token = shutdown_token.clone();
    let task_stop_flag = Arc::clone(&stop_flag);
    let task_parent_tx = parent_tx.clone();

    let join_handle = tokio::spawn(async move {
        run_pump(
            task_tp.clone(),
            consumer_actor,
            message_builder,
            tx,
            task_token,
            task_stop_flag,
        )
        .await;
        let _ = task_parent_tx.send(Command::SubCancelled { tp: task_tp });
    });

    let control = Control {
        tp: tp.clone(),
        shutdown_token,
        stop_flag,
        join_handle,
    };
    let source = SubSource {
        tp,
        rx: ReceiverStream::new(rx),
    };
    (source, control)
}

/// §4.2.2: while downstream is available, drain the buffer; once empty,
/// issue a single outstanding `RequestMessages` and wait for its reply (or
/// for cancellation, or for the consumer actor to die).
async fn run_pump<B>(
    tp: Partition,
    consumer_actor: Arc<dyn ConsumerHandle>,
    message_builder: Arc<B>,
    tx: mpsc::Sender<Result<B::Msg, MultiplexerError>>,
    shutdown_token: CancellationToken,
    stop_flag: Arc<AtomicBool>,
) where
    B: MessageBuilder,
{
    let mut buffer: VecDeque<ConsumerRecord> = VecDeque::new();
    let mut terminated = consumer_actor.terminated();

    if *terminated.borrow() {
        let _ = tx.send(Err(MultiplexerError::consumer_failed("consumer actor already terminated"))).await;
        return;
    }

    loop {
        while let Some(record) = buffer.pop_front() {
            let msg = message_builder.create_message(record);
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    debug!(%tp, "subsource shut down while draining buffer");
                    return;
                }
                _ = tx.closed() => {
                    debug!(%tp, "downstream dropped while draining buffer, subsource cancelling");
                    return;
                }
                send_result = tx.send(Ok(msg)) => {
                    if send_result.is_err() {
                        debug!(%tp, "downstream dropped, subsource cancelling");
                        return;
                    }
                }
            }
        }

        if stop_flag.load(Ordering::Relaxed) {
            debug!(%tp, "subsource drained and stopping cooperatively");
            return;
        }

        let request = consumer_actor.request_messages(tp.clone());
        tokio::select! {
            _ = shutdown_token.cancelled() => {
                debug!(%tp, "subsource shut down while awaiting request");
                return;
            }
            _ = tx.closed() => {
                debug!(%tp, "downstream dropped while awaiting request, subsource cancelling");
                return;
            }
            changed = terminated.changed() => {
                if changed.is_ok() && *terminated.borrow() {
                    let _ = tx.send(Err(MultiplexerError::consumer_failed("consumer actor terminated"))).await;
                    return;
                }
            }
            result = request => {
                match result {
                    Ok(records) => buffer.extend(records),
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                }
            }
        }
    }
}
