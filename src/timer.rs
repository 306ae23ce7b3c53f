//! One-shot timers that post back into the socket driver.
//!
//! Each timer is a spawned tokio task that sleeps and then sends its
//! [`TimerEvent`] on the driver's internal queue. Cancelling (or dropping the
//! handle) aborts the task, but an abort can lose the race with a firing that
//! is already queued, so every event carries a token the driver re-checks
//! before acting.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// Timer payload delivered to the socket driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TimerEvent {
    /// Heartbeat tick for connection epoch `epoch`.
    Heartbeat { epoch: u64 },
    /// Reconnect attempt for disconnect generation `generation`.
    Reconnect { generation: u64 },
    /// Push `msg_ref` on `topic` ran out of time.
    PushTimeout { topic: String, msg_ref: String },
    /// Rejoin attempt for `topic`, valid only while the channel's rejoin
    /// generation still equals `generation`.
    Rejoin { topic: String, generation: u64 },
}

/// Handle to a scheduled timer. Dropping it cancels the timer.
#[derive(Debug)]
pub(crate) struct Timer {
    task: JoinHandle<()>,
}

impl Timer {
    /// Schedule `event` to be sent on `tx` after `delay`.
    pub(crate) fn schedule(
        tx: &UnboundedSender<TimerEvent>,
        delay: Duration,
        event: TimerEvent,
    ) -> Self {
        let tx = tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Receiver gone means the driver has exited; nothing to notify.
            let _ = tx.send(event);
        });
        Self { task }
    }

    /// Stop the timer without firing.
    pub(crate) fn cancel(self) {
        self.task.abort();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
