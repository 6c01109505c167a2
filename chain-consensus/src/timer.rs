//! Phase timers for the round driver

use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

/// How a phase wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseWake {
    /// The full window elapsed
    Elapsed,
    /// The phase became ready before the window closed
    Ready,
}

/// Waits out a phase window, optionally returning as soon as the phase is ready.
///
/// The deadline is fixed when the wait starts, so the window is also the
/// worst-case duration with early wake enabled.
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimer {
    early_wake: bool,
}

impl PhaseTimer {
    pub fn new(early_wake: bool) -> Self {
        Self { early_wake }
    }

    pub fn early_wake(&self) -> bool {
        self.early_wake
    }

    /// Wait for `window`; `ready` is re-checked whenever `changed` fires.
    pub async fn wait(
        &self,
        window: Duration,
        changed: &Notify,
        ready: impl Fn() -> bool,
    ) -> PhaseWake {
        let deadline = Instant::now() + window;

        if !self.early_wake {
            sleep_until(deadline).await;
            return PhaseWake::Elapsed;
        }

        loop {
            let notified = changed.notified();
            tokio::pin!(notified);
            // Register before checking so a change between check and await is not lost
            notified.as_mut().enable();

            if ready() {
                return PhaseWake::Ready;
            }

            tokio::select! {
                _ = sleep_until(deadline) => return PhaseWake::Elapsed,
                _ = &mut notified => {}
            }
        }
    }
}
