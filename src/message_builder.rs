use crate::types::ConsumerRecord;

/// Pure transformation from a raw `ConsumerRecord` to the message type the
/// embedding program wants downstream. Called on the owning SubSource's task,
/// never blocks and never touches the consumer actor.
pub trait MessageBuilder: Send + Sync + 'static {
    type Msg: Send + 'static;

    fn create_message(&self, record: ConsumerRecord) -> Self::Msg;
}

impl<F, M> MessageBuilder for F
where
    F: Fn(ConsumerRecord) -> M + Send + Sync + 'static,
    M: Send + 'static,
{
    type Msg = M;

    fn create_message(&self, record: ConsumerRecord) -> M {
        (self)(record)
    }
}
