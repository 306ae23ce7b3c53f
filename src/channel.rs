//! Per-topic channel state machine.
//!
//! ```text
//!            join                 "ok"
//!   Closed ────────► Joining ───────────► Joined
//!     ▲                 │  ▲                 │
//!     │     "error" /   │  │ rejoin timer    │ phx_error /
//!     │     timeout     ▼  │ or socket open  ▼ socket drop
//!     │               Errored ◄──────────────┘
//!     │                 │
//!     └──── Leaving ◄───┘  leave (from any non-closed state)
//!          reply/timeout
//! ```
//!
//! [`Channel`] is owned by the socket driver and mutated only there; it
//! writes outgoing frames into the driver's [`Link`] instead of touching the
//! transport, so every transition is synchronous. Applications hold a
//! [`ChannelHandle`], which turns each call into a driver command.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};

use crate::bindings::{Bindings, EventCallback, MessageCallback, SubscriptionRef};
use crate::error::{PhoenixError, Result};
use crate::message::{Event, Message, Reply};
use crate::push::{Push, PushBuilder, PushKind, STATUS_ERROR, STATUS_OK, STATUS_TIMEOUT};
use crate::reference::RefGenerator;
use crate::socket::{ChannelCommand, ChannelOp, Command, Link};
use crate::timer::{Timer, TimerEvent};

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChannelState {
    /// Not joined (initial and final state).
    #[default]
    Closed,
    /// Join requested, waiting for the socket or the server's reply.
    Joining,
    /// Server accepted the join.
    Joined,
    /// Join failed or the connection dropped; a rejoin is pending.
    Errored,
    /// Leave sent, waiting for the reply.
    Leaving,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Joining => "joining",
            Self::Joined => "joined",
            Self::Errored => "errored",
            Self::Leaving => "leaving",
        };
        f.write_str(name)
    }
}

/// Whether the driver should keep the channel after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Keep,
    Remove,
}

/// Driver-side channel bookkeeping.
pub(crate) struct Channel {
    topic: String,
    state: ChannelState,
    state_tx: Arc<watch::Sender<ChannelState>>,
    /// Reused across rejoins; its payload is the original join payload.
    join_push: Option<Push>,
    /// Ref of the current join attempt; the wire `join_ref` of our frames.
    join_ref: Option<String>,
    /// Application asked to be joined (cleared by leave).
    wants_join: bool,
    /// Pushes waiting for the channel to reach `Joined`.
    buffer: VecDeque<Push>,
    /// Sent pushes awaiting a reply, keyed by ref.
    pending: HashMap<String, Push>,
    leave_ref: Option<String>,
    bindings: Bindings,
    rejoin_timer: Option<Timer>,
    rejoin_generation: u64,
    rejoin_attempts: u32,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("topic", &self.topic)
            .field("state", &self.state)
            .field("join_ref", &self.join_ref)
            .field("buffered", &self.buffer.len())
            .field("pending", &self.pending.len())
            .field("bindings", &self.bindings)
            .finish_non_exhaustive()
    }
}

impl Channel {
    pub(crate) fn new(topic: String, state_tx: Arc<watch::Sender<ChannelState>>) -> Self {
        state_tx.send_replace(ChannelState::Closed);
        Self {
            topic,
            state: ChannelState::Closed,
            state_tx,
            join_push: None,
            join_ref: None,
            wants_join: false,
            buffer: VecDeque::new(),
            pending: HashMap::new(),
            leave_ref: None,
            bindings: Bindings::default(),
            rejoin_timer: None,
            rejoin_generation: 0,
            rejoin_attempts: 0,
        }
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.state
    }

    /// Whether a sent push (leave included) is still waiting on `msg_ref`.
    ///
    /// Such replies are accepted even when they carry the join_ref of an
    /// earlier join.
    pub(crate) fn awaits_reply(&self, msg_ref: &str) -> bool {
        self.pending.contains_key(msg_ref)
    }

    fn set_state(&mut self, state: ChannelState) {
        if self.state != state {
            log::debug!("[Channel {}] {} -> {}", self.topic, self.state, state);
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    /// Whether an inbound frame tagged `join_ref` belongs to the current join.
    ///
    /// Broadcasts without a join ref always match.
    pub(crate) fn is_member(&self, join_ref: Option<&str>) -> bool {
        match join_ref {
            None => true,
            Some(frame_ref) => self.join_ref.as_deref() == Some(frame_ref),
        }
    }

    // ------------------------------------------------------------------
    // Application operations
    // ------------------------------------------------------------------

    pub(crate) fn join(&mut self, push: Push, link: &mut Link) -> Result<()> {
        if matches!(self.state, ChannelState::Joining | ChannelState::Joined) {
            return Err(PhoenixError::DuplicateJoin(self.topic.clone()));
        }
        self.cancel_rejoin();
        self.leave_ref = None;
        self.join_push = Some(push);
        self.wants_join = true;
        self.rejoin_attempts = 0;
        self.set_state(ChannelState::Joining);
        self.send_join(link);
        Ok(())
    }

    pub(crate) fn push(&mut self, push: Push, link: &mut Link) {
        if self.state == ChannelState::Joined && link.epoch.is_some() {
            self.send_push(push, link);
        } else {
            log::debug!(
                "[Channel {}] Buffering '{}' until joined (state={})",
                self.topic,
                push.event,
                self.state
            );
            self.buffer.push_back(push);
        }
    }

    pub(crate) fn leave(&mut self, mut push: Push, link: &mut Link) -> Disposition {
        self.wants_join = false;
        self.cancel_rejoin();

        let join_reached_server = match self.state {
            ChannelState::Joined => true,
            ChannelState::Joining => self.join_push.as_ref().is_some_and(Push::is_in_flight),
            _ => false,
        };

        match link.epoch {
            Some(epoch) if join_reached_server => {
                self.set_state(ChannelState::Leaving);
                let msg_ref = link.refs.next();
                push.prepare(msg_ref.clone(), epoch);
                link.frames
                    .push(push.to_message(&self.topic, self.join_ref.clone()));
                push.mark_sent(&self.topic, link.default_timeout, &link.timers);
                log::info!("[Channel {}] Leaving", self.topic);
                self.leave_ref = Some(msg_ref.clone());
                self.pending.insert(msg_ref, push);
                Disposition::Keep
            }
            _ => {
                // Nothing to tell the server: close locally.
                push.trigger(STATUS_OK, &json!({}));
                self.close("left")
            }
        }
    }

    pub(crate) fn on(&mut self, event: &str, id: SubscriptionRef, callback: EventCallback) {
        if Event::from(event).is_reserved() {
            log::warn!(
                "[Channel {}] '{}' is a protocol event and is never dispatched to subscribers",
                self.topic,
                event
            );
        }
        self.bindings.on(event, id, callback);
    }

    pub(crate) fn off(&mut self, event: &str, id: Option<SubscriptionRef>) {
        let removed = self.bindings.off(event, id);
        log::debug!(
            "[Channel {}] Removed {} subscription(s) for '{}'",
            self.topic,
            removed,
            event
        );
    }

    pub(crate) fn on_any(&mut self, id: SubscriptionRef, callback: MessageCallback) {
        self.bindings.on_any(id, callback);
    }

    pub(crate) fn off_any(&mut self, id: SubscriptionRef) {
        let removed = self.bindings.off_any(id);
        log::debug!(
            "[Channel {}] Removed {} catch-all subscription(s)",
            self.topic,
            removed
        );
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    pub(crate) fn handle_reply(&mut self, msg_ref: &str, reply: &Reply, link: &mut Link) -> Disposition {
        if self.join_ref.as_deref() == Some(msg_ref) {
            self.handle_join_reply(reply, link);
            return Disposition::Keep;
        }

        let Some(mut push) = self.pending.remove(msg_ref) else {
            log::debug!(
                "[Channel {}] Dropping reply for unknown or resolved ref {}",
                self.topic,
                msg_ref
            );
            return Disposition::Keep;
        };
        if push.epoch() != link.epoch {
            log::debug!("[Channel {}] Dropping reply from a previous connection", self.topic);
            return Disposition::Keep;
        }
        push.trigger(&reply.status, &reply.response);

        if self.leave_ref.as_deref() == Some(msg_ref) {
            self.leave_ref = None;
            return self.close("left");
        }
        Disposition::Keep
    }

    fn handle_join_reply(&mut self, reply: &Reply, link: &mut Link) {
        let Some(push) = self.join_push.as_mut() else {
            return;
        };
        if push.epoch() != link.epoch || !push.trigger(&reply.status, &reply.response) {
            log::debug!("[Channel {}] Ignoring late join reply", self.topic);
            return;
        }
        if self.state != ChannelState::Joining {
            return;
        }

        if reply.status == STATUS_OK {
            log::info!("[Channel {}] Joined", self.topic);
            self.rejoin_attempts = 0;
            self.cancel_rejoin();
            self.set_state(ChannelState::Joined);
            while let Some(push) = self.buffer.pop_front() {
                self.send_push(push, link);
            }
        } else {
            let err = PhoenixError::JoinRejected {
                topic: self.topic.clone(),
                response: reply.response.clone(),
            };
            log::warn!("[Channel {}] {}", self.topic, err);
            self.set_state(ChannelState::Errored);
            self.schedule_rejoin(link);
        }
    }

    /// Server-side `phx_error`: the channel process crashed.
    pub(crate) fn handle_error(&mut self, link: &mut Link) {
        if !matches!(self.state, ChannelState::Joined | ChannelState::Joining) {
            return;
        }
        log::warn!("[Channel {}] Server reported channel error", self.topic);
        self.abandon_in_flight("channel errored");
        self.set_state(ChannelState::Errored);
        self.schedule_rejoin(link);
    }

    /// Server-side `phx_close`: the server ended the channel.
    pub(crate) fn handle_server_close(&mut self) -> Disposition {
        log::info!("[Channel {}] Closed by server", self.topic);
        self.close("closed by server")
    }

    pub(crate) fn dispatch(&mut self, message: &Message) {
        if message.event.is_reserved() {
            log::trace!(
                "[Channel {}] Not dispatching protocol event '{}'",
                self.topic,
                message.event
            );
            return;
        }
        let invoked = self
            .bindings
            .dispatch(message.event.as_str(), &message.payload);
        log::trace!(
            "[Channel {}] Dispatched '{}' to {} subscriber(s)",
            self.topic,
            message.event,
            invoked
        );
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    pub(crate) fn handle_timeout(&mut self, msg_ref: &str, link: &mut Link) -> Disposition {
        if self.join_ref.as_deref() == Some(msg_ref) {
            let timed_out = self
                .join_push
                .as_mut()
                .is_some_and(|push| push.is_in_flight() && push.trigger(STATUS_TIMEOUT, &Value::Null));
            if timed_out && self.state == ChannelState::Joining {
                log::warn!("[Channel {}] Join timed out", self.topic);
                self.set_state(ChannelState::Errored);
                self.schedule_rejoin(link);
            }
            return Disposition::Keep;
        }

        let Some(mut push) = self.pending.remove(msg_ref) else {
            log::trace!("[Channel {}] Stale timeout for ref {}", self.topic, msg_ref);
            return Disposition::Keep;
        };
        let err = PhoenixError::PushTimeout {
            topic: self.topic.clone(),
            event: push.event.to_string(),
        };
        log::debug!("[Channel {}] {}", self.topic, err);
        push.trigger(STATUS_TIMEOUT, &Value::Null);

        if self.leave_ref.as_deref() == Some(msg_ref) {
            self.leave_ref = None;
            return self.close("leave timed out");
        }
        Disposition::Keep
    }

    pub(crate) fn handle_rejoin_timer(&mut self, generation: u64, link: &mut Link) {
        if generation != self.rejoin_generation {
            log::trace!("[Channel {}] Stale rejoin timer", self.topic);
            return;
        }
        self.rejoin_timer = None;
        if !self.wants_join || self.state != ChannelState::Errored {
            return;
        }
        if link.epoch.is_none() {
            log::debug!(
                "[Channel {}] Socket not open; rejoin deferred until reconnect",
                self.topic
            );
            return;
        }
        self.rejoin(link);
    }

    // ------------------------------------------------------------------
    // Socket lifecycle
    // ------------------------------------------------------------------

    pub(crate) fn on_socket_open(&mut self, link: &mut Link) {
        if self.wants_join && self.state != ChannelState::Joined {
            self.rejoin(link);
        }
    }

    /// Connection lost or closed on purpose. Rejoin happens on the next open.
    pub(crate) fn on_socket_down(&mut self) -> Disposition {
        self.cancel_rejoin();
        match self.state {
            ChannelState::Leaving => self.close("connection lost"),
            ChannelState::Joined | ChannelState::Joining => {
                self.abandon_in_flight("connection lost");
                self.set_state(ChannelState::Errored);
                Disposition::Keep
            }
            _ => {
                self.abandon_in_flight("connection lost");
                Disposition::Keep
            }
        }
    }

    /// Socket shut down: resolve everything and close.
    pub(crate) fn close_for_shutdown(&mut self) {
        self.close("socket shut down");
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn rejoin(&mut self, link: &mut Link) {
        if !self.wants_join || self.state == ChannelState::Leaving {
            return;
        }
        self.cancel_rejoin();
        self.set_state(ChannelState::Joining);
        self.send_join(link);
    }

    fn send_join(&mut self, link: &mut Link) {
        let Some(epoch) = link.epoch else {
            log::debug!(
                "[Channel {}] Socket not open; join sent once connected",
                self.topic
            );
            return;
        };
        let Some(push) = self.join_push.as_mut() else {
            return;
        };
        let msg_ref = link.refs.next();
        push.prepare(msg_ref.clone(), epoch);
        link.frames
            .push(push.to_message(&self.topic, Some(msg_ref.clone())));
        push.mark_sent(&self.topic, link.default_timeout, &link.timers);
        log::debug!("[Channel {}] Sent join (ref={})", self.topic, msg_ref);
        self.join_ref = Some(msg_ref);
    }

    fn send_push(&mut self, mut push: Push, link: &mut Link) {
        let Some(epoch) = link.epoch else {
            self.buffer.push_back(push);
            return;
        };
        let msg_ref = link.refs.next();
        push.prepare(msg_ref.clone(), epoch);
        link.frames
            .push(push.to_message(&self.topic, self.join_ref.clone()));
        push.mark_sent(&self.topic, link.default_timeout, &link.timers);
        self.pending.insert(msg_ref, push);
    }

    fn schedule_rejoin(&mut self, link: &Link) {
        if !self.wants_join {
            return;
        }
        self.cancel_rejoin();
        self.rejoin_attempts = self.rejoin_attempts.saturating_add(1);
        let delay = link.rejoin_after.delay(self.rejoin_attempts);
        log::info!(
            "[Channel {}] Rejoining in {}ms (attempt {})",
            self.topic,
            delay.as_millis(),
            self.rejoin_attempts
        );
        self.rejoin_timer = Some(Timer::schedule(
            &link.timers,
            delay,
            TimerEvent::Rejoin {
                topic: self.topic.clone(),
                generation: self.rejoin_generation,
            },
        ));
    }

    fn cancel_rejoin(&mut self) {
        if let Some(timer) = self.rejoin_timer.take() {
            timer.cancel();
        }
        // Invalidates a firing that was already queued.
        self.rejoin_generation += 1;
    }

    /// Resolve the in-flight join and every sent push with `"error"`.
    ///
    /// Buffered pushes stay queued for the next successful join.
    fn abandon_in_flight(&mut self, reason: &str) {
        let response = json!({ "reason": reason });
        if let Some(push) = self.join_push.as_mut() {
            if push.is_in_flight() {
                push.trigger(STATUS_ERROR, &response);
            }
            push.cancel_timeout();
        }
        self.leave_ref = None;

        let mut pending: Vec<(String, Push)> = self.pending.drain().collect();
        pending.sort_by_key(|(msg_ref, _)| msg_ref.parse::<u64>().unwrap_or(u64::MAX));
        for (_, mut push) in pending {
            push.trigger(STATUS_ERROR, &response);
        }
    }

    fn close(&mut self, reason: &str) -> Disposition {
        self.wants_join = false;
        self.cancel_rejoin();
        self.abandon_in_flight(reason);
        let response = json!({ "reason": reason });
        for mut push in self.buffer.drain(..) {
            push.trigger(STATUS_ERROR, &response);
        }
        self.join_ref = None;
        self.set_state(ChannelState::Closed);
        Disposition::Remove
    }
}

/// Application handle for one topic.
///
/// Cheap to clone; every clone addresses the same channel. Obtained from
/// [`Socket::channel`](crate::Socket::channel).
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    topic: String,
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<watch::Sender<ChannelState>>,
    refs: Arc<RefGenerator>,
}

impl ChannelHandle {
    pub(crate) fn new(
        topic: String,
        commands: mpsc::UnboundedSender<Command>,
        state: Arc<watch::Sender<ChannelState>>,
        refs: Arc<RefGenerator>,
    ) -> Self {
        Self {
            topic,
            commands,
            state,
            refs,
        }
    }

    /// Channel topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Wait until the channel reaches `target`.
    ///
    /// # Errors
    ///
    /// Returns [`PhoenixError::SocketClosed`] if the socket driver exits first.
    pub async fn wait_for_state(&self, target: ChannelState) -> Result<()> {
        let mut rx = self.state.subscribe();
        let closed = self.commands.closed();
        tokio::pin!(closed);
        tokio::select! {
            result = rx.wait_for(|state| *state == target) => {
                result.map(|_| ()).map_err(|_| PhoenixError::SocketClosed)
            }
            () = &mut closed => Err(PhoenixError::SocketClosed),
        }
    }

    /// Join the channel with `payload`. The payload is reused by every rejoin.
    pub fn join(&self, payload: Value) -> PushBuilder {
        self.builder(PushKind::Join, payload)
    }

    /// Push `event` with `payload`, buffering until the channel is joined.
    pub fn push(&self, event: impl Into<String>, payload: Value) -> PushBuilder {
        self.builder(PushKind::Event(event.into()), payload)
    }

    /// Leave the channel.
    pub fn leave(&self) -> PushBuilder {
        self.builder(PushKind::Leave, json!({}))
    }

    /// Subscribe `callback` to broadcasts of `event` on this channel.
    ///
    /// Registering twice delivers twice. Protocol events (`phx_reply`, ...)
    /// may be registered but never fire.
    ///
    /// # Errors
    ///
    /// Returns [`PhoenixError::SocketClosed`] when the socket has shut down.
    pub fn on<F>(&self, event: impl Into<String>, callback: F) -> Result<SubscriptionRef>
    where
        F: FnMut(&Value) + Send + 'static,
    {
        let id = SubscriptionRef(self.refs.next_raw());
        self.send_op(ChannelOp::On {
            event: event.into(),
            id,
            callback: Box::new(callback),
        })?;
        Ok(id)
    }

    /// Remove the subscription `id` for `event`, or all of the event's
    /// subscriptions when `id` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`PhoenixError::SocketClosed`] when the socket has shut down.
    pub fn off(&self, event: impl Into<String>, id: Option<SubscriptionRef>) -> Result<()> {
        self.send_op(ChannelOp::Off {
            event: event.into(),
            id,
        })
    }

    /// Subscribe `callback` to every broadcast on this channel, whatever its
    /// event. Protocol events are still never delivered.
    ///
    /// # Errors
    ///
    /// Returns [`PhoenixError::SocketClosed`] when the socket has shut down.
    pub fn on_any<F>(&self, callback: F) -> Result<SubscriptionRef>
    where
        F: FnMut(&str, &Value) + Send + 'static,
    {
        let id = SubscriptionRef(self.refs.next_raw());
        self.send_op(ChannelOp::OnAny {
            id,
            callback: Box::new(callback),
        })?;
        Ok(id)
    }

    /// Remove a subscription made with [`on_any`](Self::on_any).
    ///
    /// # Errors
    ///
    /// Returns [`PhoenixError::SocketClosed`] when the socket has shut down.
    pub fn off_any(&self, id: SubscriptionRef) -> Result<()> {
        self.send_op(ChannelOp::OffAny { id })
    }

    fn builder(&self, kind: PushKind, payload: Value) -> PushBuilder {
        PushBuilder::new(
            self.commands.clone(),
            self.topic.clone(),
            Arc::clone(&self.state),
            kind,
            payload,
        )
    }

    fn send_op(&self, op: ChannelOp) -> Result<()> {
        self.commands
            .send(Command::Channel(ChannelCommand {
                topic: self.topic.clone(),
                state: Arc::clone(&self.state),
                op,
            }))
            .map_err(|_| PhoenixError::SocketClosed)
    }
}
