//! # Result Normalization
//!
//! Turns whatever an evaluation produced into something the codec can send.
//!
//! ```text
//! Direct --pending--> AwaitingInner --pending--> AwaitingInner ...
//!   |                      |
//!   +--sequence--> MaterializingSequence --> Sent
//!   +-------------plain value------------> Sent
//! ```
//!
//! A pending result may resolve to another pending result or to a sequence.
//! The number of nested awaits is bounded by `MAX_INNER_AWAITS`.

use meshcall::Error;
use meshcall::Result;
use meshcall::Value;

pub const MAX_INNER_AWAITS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Direct,
    AwaitingInner,
    MaterializingSequence,
    Sent,
}

struct Normalizer {
    stage: Stage,
    awaits: usize,
}

impl Normalizer {
    /// Advances one transition. Returns the value once the stage is `Sent`.
    async fn step(&mut self, value: Value) -> Result<Value> {
        let (next, value) = match value {
            Value::Pending(pending) => {
                self.awaits += 1;
                if self.awaits > MAX_INNER_AWAITS {
                    return Err(Error::RecursionLimitExceeded);
                }
                let fut = pending
                    .take()
                    .ok_or_else(|| Error::Invocation("pending result already consumed".into()))?;
                (Stage::AwaitingInner, fut.await?)
            }
            Value::Sequence(seq) => {
                let items = seq
                    .take()
                    .ok_or_else(|| Error::Invocation("sequence already consumed".into()))?;
                (Stage::MaterializingSequence, Value::array(seq.elem().clone(), items.collect()))
            }
            other => (Stage::Sent, other),
        };
        tracing::trace!(from = ?self.stage, to = ?next, "normalize");
        self.stage = next;
        Ok(value)
    }
}

/// Awaits pending results and materializes sequences into arrays.
pub async fn normalize(value: Value) -> Result<Value> {
    let mut machine = Normalizer { stage: Stage::Direct, awaits: 0 };
    let mut value = value;
    loop {
        value = machine.step(value).await?;
        if machine.stage == Stage::Sent {
            return Ok(value);
        }
    }
}
