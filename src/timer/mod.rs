mod controller;
mod state;

pub use controller::{ExpiryOutcome, TimerController, TimerOptions, TimerSnapshot};
pub use state::{calculate_remaining, remaining_secs, TimerSlot, TimerStatus};
