use std::collections::HashSet;

use crate::error::MultiplexerError;
use crate::sub_source::Control;
use crate::types::Partition;

/// Everything that can mutate Multiplexer state, serialised onto its single
/// driver task (§9, "callback serialisation"). External callers only ever
/// enqueue; all mutation happens inside `Multiplexer::run`.
pub(crate) enum Command {
    AssignPartitions(HashSet<Partition>),
    RevokePartitions(HashSet<Partition>),
    SeekDone {
        partitions: HashSet<Partition>,
        result: Result<(), MultiplexerError>,
    },
    SubStarted {
        tp: Partition,
        control: Control,
    },
    SubCancelled {
        tp: Partition,
    },
    RevokeTimerFired {
        generation: u64,
    },
    ConsumerTerminated,
    /// Downstream capacity may have freed up since the emit loop last gave
    /// up on `try_reserve_owned`; re-enter it. Keeps the backpressure wait
    /// off the driver's single command queue (§9, "Pull as just another
    /// serialised event").
    Pull,
    Stop,
    Shutdown,
}
