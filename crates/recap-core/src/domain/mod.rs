//! Domain model (IDs, job record, state, retry decision, errors, events).

pub mod decision;
pub mod errors;
pub mod events;
pub mod ids;
pub mod job;
pub mod state;

pub use self::decision::{RetryDecision, RetryPolicy};
pub use self::errors::QueueError;
pub use self::events::QueueEvent;
pub use self::ids::{JobId, WorkerId};
pub use self::job::{JobKind, JobRecord, NewJob};
pub use self::state::JobState;
