//! Delayed, cancellable command delivery
//!
//! Timers are plain tokio tasks that sleep and then post a command back
//! into the engine's channel, so a firing timer is processed like any other
//! command. The scheduler only holds a weak sender: pending timers never keep
//! a stopped engine alive.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

/// Cancels its timer when cancelled explicitly or dropped
#[derive(Debug)]
pub struct TimerHandle {
    abort: AbortHandle,
}

impl TimerHandle {
    /// Cancel the timer (no-op if it already fired)
    pub fn cancel(&self) {
        self.abort.abort();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

/// Issues one-shot timers that deliver a command of type `C`
#[derive(Debug)]
pub struct Scheduler<C> {
    commands: mpsc::WeakSender<C>,
}

impl<C> Clone for Scheduler<C> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
        }
    }
}

impl<C: Send + 'static> Scheduler<C> {
    /// Create a scheduler delivering into the given channel
    pub fn new(commands: mpsc::WeakSender<C>) -> Self {
        Self { commands }
    }

    /// Deliver `command` after `delay`
    pub fn schedule(&self, delay: Duration, command: C) -> TimerHandle {
        self.schedule_at(Instant::now() + delay, command)
    }

    /// Deliver `command` at `deadline`
    pub fn schedule_at(&self, deadline: Instant, command: C) -> TimerHandle {
        let commands = self.commands.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(commands) = commands.upgrade() else {
                debug!("Timer fired after engine shutdown");
                return;
            };
            if commands.send(command).await.is_err() {
                debug!("Timer fired after engine shutdown");
            }
        });
        TimerHandle {
            abort: task.abort_handle(),
        }
    }
}
