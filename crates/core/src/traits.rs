//! The state machine trait implemented by replicas and clients.

use crate::{Action, Event};
use std::time::Duration;

/// A synchronous, deterministic state machine.
///
/// Implementations mutate themselves, never perform I/O, and express all
/// effects through returned [`Action`]s. The runner must call
/// [`StateMachine::set_time`] before each `handle` so timeout arithmetic
/// sees a consistent clock.
pub trait StateMachine {
    /// Advance the machine's notion of the current time.
    fn set_time(&mut self, now: Duration);

    /// Process one event and return the resulting actions.
    fn handle(&mut self, event: Event) -> Vec<Action>;
}
