//! Outstanding requests and reply correlation.
//!
//! A [`Push`] is one request (join, leave, or application event) owned by the
//! socket driver. It is resolved exactly once per send by a reply, its
//! timeout, or its channel erroring or closing; later attempts are ignored
//! because a reply and a timeout can race.
//!
//! Callers never touch a `Push` directly. They build one with a
//! [`PushBuilder`], attach status callbacks, and hand it to the driver with
//! [`PushBuilder::send`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use crate::channel::ChannelState;
use crate::error::{PhoenixError, Result};
use crate::message::{Event, Message};
use crate::socket::{ChannelCommand, ChannelOp, Command};
use crate::timer::{Timer, TimerEvent};

/// Callback invoked with a reply's `response`.
pub type ReplyCallback = Box<dyn FnMut(&Value) + Send + 'static>;

/// Status passed to callbacks when no reply arrived in time.
pub const STATUS_TIMEOUT: &str = "timeout";

/// Status of a successful reply.
pub const STATUS_OK: &str = "ok";

/// Status of a failed reply, also used when a push is abandoned.
pub const STATUS_ERROR: &str = "error";

/// Driver-side state of one request.
pub(crate) struct Push {
    pub(crate) event: Event,
    pub(crate) payload: Value,
    timeout: Option<Duration>,
    callbacks: Vec<(String, ReplyCallback)>,
    msg_ref: Option<String>,
    epoch: Option<u64>,
    sent: bool,
    resolved: bool,
    timer: Option<Timer>,
}

impl std::fmt::Debug for Push {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Push")
            .field("event", &self.event)
            .field("msg_ref", &self.msg_ref)
            .field("sent", &self.sent)
            .field("resolved", &self.resolved)
            .field("callbacks", &self.callbacks.len())
            .finish_non_exhaustive()
    }
}

impl Push {
    pub(crate) fn new(
        event: Event,
        payload: Value,
        timeout: Option<Duration>,
        callbacks: Vec<(String, ReplyCallback)>,
    ) -> Self {
        Self {
            event,
            payload,
            timeout,
            callbacks,
            msg_ref: None,
            epoch: None,
            sent: false,
            resolved: false,
            timer: None,
        }
    }

    pub(crate) fn msg_ref(&self) -> Option<&str> {
        self.msg_ref.as_deref()
    }

    pub(crate) fn epoch(&self) -> Option<u64> {
        self.epoch
    }

    /// Sent and still waiting for a reply.
    pub(crate) fn is_in_flight(&self) -> bool {
        self.sent && !self.resolved
    }

    /// Assign a fresh ref for a (re)send in connection epoch `epoch`.
    ///
    /// Clears any previous resolution: a rejoin reuses the join push, and each
    /// attempt resolves independently.
    pub(crate) fn prepare(&mut self, msg_ref: String, epoch: u64) {
        self.cancel_timeout();
        self.msg_ref = Some(msg_ref);
        self.epoch = Some(epoch);
        self.sent = false;
        self.resolved = false;
    }

    /// Frame for this push on `topic`.
    pub(crate) fn to_message(&self, topic: &str, join_ref: Option<String>) -> Message {
        Message {
            join_ref,
            msg_ref: self.msg_ref.clone(),
            topic: topic.to_string(),
            event: self.event.clone(),
            payload: self.payload.clone(),
        }
    }

    /// Record the frame as handed to the transport and start the timeout.
    pub(crate) fn mark_sent(
        &mut self,
        topic: &str,
        default_timeout: Duration,
        timers: &mpsc::UnboundedSender<TimerEvent>,
    ) {
        self.sent = true;
        self.start_timeout(topic, default_timeout, timers);
    }

    /// Start the timeout timer unless one is already running.
    pub(crate) fn start_timeout(
        &mut self,
        topic: &str,
        default_timeout: Duration,
        timers: &mpsc::UnboundedSender<TimerEvent>,
    ) {
        if self.timer.is_some() {
            return;
        }
        let Some(msg_ref) = self.msg_ref.clone() else {
            return;
        };
        let delay = self.timeout.unwrap_or(default_timeout);
        self.timer = Some(Timer::schedule(
            timers,
            delay,
            TimerEvent::PushTimeout {
                topic: topic.to_string(),
                msg_ref,
            },
        ));
    }

    /// Stop the timeout timer without resolving.
    pub(crate) fn cancel_timeout(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }

    /// Resolve with `status`, invoking the matching callbacks in registration order.
    ///
    /// Returns `false` (and does nothing) if already resolved.
    pub(crate) fn trigger(&mut self, status: &str, response: &Value) -> bool {
        if self.resolved {
            return false;
        }
        self.resolved = true;
        self.cancel_timeout();
        for (_, callback) in self
            .callbacks
            .iter_mut()
            .filter(|(registered, _)| registered == status)
        {
            callback(response);
        }
        true
    }
}

/// What a [`PushBuilder`] asks the channel to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PushKind {
    Join,
    Event(String),
    Leave,
}

/// Caller-side handle for a join, leave, or event push.
///
/// Attach callbacks with [`receive`](Self::receive), optionally override the
/// timeout, then [`send`](Self::send). Callbacks run on the socket driver task
/// and must not block.
///
/// ```ignore
/// channel
///     .push("shout", json!({"id": 1}))
///     .receive("ok", |resp| println!("ok: {resp}"))
///     .receive("timeout", |_| println!("no reply"))
///     .send()
///     .await?;
/// ```
#[must_use = "a push does nothing until `send` is awaited"]
pub struct PushBuilder {
    commands: mpsc::UnboundedSender<Command>,
    topic: String,
    state: Arc<watch::Sender<ChannelState>>,
    kind: PushKind,
    payload: Value,
    timeout: Option<Duration>,
    callbacks: Vec<(String, ReplyCallback)>,
}

impl std::fmt::Debug for PushBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushBuilder")
            .field("topic", &self.topic)
            .field("kind", &self.kind)
            .field("timeout", &self.timeout)
            .field("callbacks", &self.callbacks.len())
            .finish_non_exhaustive()
    }
}

impl PushBuilder {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        topic: String,
        state: Arc<watch::Sender<ChannelState>>,
        kind: PushKind,
        payload: Value,
    ) -> Self {
        Self {
            commands,
            topic,
            state,
            kind,
            payload,
            timeout: None,
            callbacks: Vec::new(),
        }
    }

    /// Register `callback` for replies with `status` (`"ok"`, `"error"`, `"timeout"`, ...).
    ///
    /// Several callbacks may share a status; they run in registration order.
    pub fn receive<F>(mut self, status: impl Into<String>, callback: F) -> Self
    where
        F: FnMut(&Value) + Send + 'static,
    {
        self.callbacks.push((status.into(), Box::new(callback)));
        self
    }

    /// Override the socket's default reply timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Hand the push to the socket driver.
    ///
    /// Resolves once the driver has accepted (sent or buffered) the push, not
    /// when the reply arrives.
    ///
    /// # Errors
    ///
    /// - [`PhoenixError::DuplicateJoin`] when joining a channel that is already
    ///   joining or joined.
    /// - [`PhoenixError::ReservedEvent`] when pushing a protocol event.
    /// - [`PhoenixError::SocketClosed`] when the socket has shut down.
    pub async fn send(self) -> Result<()> {
        let event = match &self.kind {
            PushKind::Join => Event::Join,
            PushKind::Leave => Event::Close,
            PushKind::Event(name) => {
                let event = Event::from(name.as_str());
                if event.is_reserved() {
                    return Err(PhoenixError::ReservedEvent(name.clone()));
                }
                event
            }
        };

        let push = Push::new(event, self.payload, self.timeout, self.callbacks);
        let (done_tx, done_rx) = oneshot::channel();
        let op = match self.kind {
            PushKind::Join => ChannelOp::Join { push, done: done_tx },
            PushKind::Event(_) => ChannelOp::Push { push, done: done_tx },
            PushKind::Leave => ChannelOp::Leave { push, done: done_tx },
        };

        self.commands
            .send(Command::Channel(ChannelCommand {
                topic: self.topic,
                state: self.state,
                op,
            }))
            .map_err(|_| PhoenixError::SocketClosed)?;

        done_rx.await.map_err(|_| PhoenixError::SocketClosed)?
    }
}
