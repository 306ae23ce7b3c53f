//! Socket: one multiplexed connection shared by every channel.
//!
//! # Architecture
//!
//! ```text
//!   Socket / ChannelHandle / PushBuilder          (any task)
//!         │ Command (unbounded mpsc)
//!         ▼
//!   Driver task ─────────────────────────────────────────────┐
//!     select! {                                              │
//!       commands   → connect / disconnect / channel ops      │
//!       timers     → heartbeat, reconnect, push timeout,     │
//!                    rejoin (validated by token)             │
//!       connects   → outcome of a spawned Transport::connect │
//!       inbound    → decode → route by topic and join_ref    │
//!     }                                                      │
//!     flush Link.frames → TransportWriter                    │
//!   ─────────────────────────────────────────────────────────┘
//! ```
//!
//! The driver is the only owner of connection, channel and push state.
//! Handles never mutate anything directly; they queue commands. Timers are
//! spawned tasks that post back into the driver, and every firing carries a
//! token (epoch, generation or ref) that is re-checked before it acts.
//!
//! # Reconnection
//!
//! An unexpected close, read or write failure, or a missed heartbeat moves the
//! socket to [`ConnectionState::Reconnecting`] and retries on the reconnect
//! [`Backoff`] until [`Socket::disconnect`] or [`Socket::shutdown`]. Each
//! successful connect mints a new epoch; pushes and replies from an older
//! epoch are discarded.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use url::Url;

use crate::bindings::{EventCallback, MessageCallback, SubscriptionRef};
use crate::channel::{Channel, ChannelHandle, ChannelState, Disposition};
use crate::config::{Backoff, SocketConfig};
use crate::error::{PhoenixError, Result};
use crate::message::{self, Event, Message, Reply, PHOENIX_TOPIC};
use crate::push::Push;
use crate::reference::RefGenerator;
use crate::timer::{Timer, TimerEvent};
use crate::transport::{Connection, Inbound, Transport, TransportReader, TransportWriter, WebSocketTransport};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected and not trying to connect.
    #[default]
    Closed,
    /// Transport connect in progress.
    Connecting,
    /// Connected; frames flow.
    Open,
    /// Closing on request.
    Closing,
    /// Connection lost; retry `attempt` is scheduled after `next_retry_ms`.
    Reconnecting {
        /// 1-based retry counter, reset after a successful connect.
        attempt: u32,
        /// Delay before the retry in milliseconds.
        next_retry_ms: u64,
    },
}

impl ConnectionState {
    /// Whether frames can currently be exchanged.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Connecting => f.write_str("connecting"),
            Self::Open => f.write_str("open"),
            Self::Closing => f.write_str("closing"),
            Self::Reconnecting {
                attempt,
                next_retry_ms,
            } => write!(f, "reconnecting (attempt {attempt} in {next_retry_ms}ms)"),
        }
    }
}

/// Request queued from a handle to the driver.
#[derive(Debug)]
pub(crate) enum Command {
    Connect,
    Disconnect { done: oneshot::Sender<()> },
    Shutdown { done: oneshot::Sender<()> },
    Lookup {
        topic: String,
        reply: oneshot::Sender<Arc<watch::Sender<ChannelState>>>,
    },
    Channel(ChannelCommand),
}

/// Operation addressed to one channel.
///
/// Carries the handle's state sender; the driver registers it if the topic
/// has never been looked up.
#[derive(Debug)]
pub(crate) struct ChannelCommand {
    pub(crate) topic: String,
    pub(crate) state: Arc<watch::Sender<ChannelState>>,
    pub(crate) op: ChannelOp,
}

pub(crate) enum ChannelOp {
    Join {
        push: Push,
        done: oneshot::Sender<Result<()>>,
    },
    Push {
        push: Push,
        done: oneshot::Sender<Result<()>>,
    },
    Leave {
        push: Push,
        done: oneshot::Sender<Result<()>>,
    },
    On {
        event: String,
        id: SubscriptionRef,
        callback: EventCallback,
    },
    Off {
        event: String,
        id: Option<SubscriptionRef>,
    },
    OnAny {
        id: SubscriptionRef,
        callback: MessageCallback,
    },
    OffAny {
        id: SubscriptionRef,
    },
}

impl std::fmt::Debug for ChannelOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Join { push, .. } => f.debug_tuple("Join").field(push).finish(),
            Self::Push { push, .. } => f.debug_tuple("Push").field(push).finish(),
            Self::Leave { push, .. } => f.debug_tuple("Leave").field(push).finish(),
            Self::On { event, id, .. } => f.debug_struct("On").field("event", event).field("id", id).finish(),
            Self::Off { event, id } => f.debug_struct("Off").field("event", event).field("id", id).finish(),
            Self::OnAny { id, .. } => f.debug_struct("OnAny").field("id", id).finish(),
            Self::OffAny { id } => f.debug_struct("OffAny").field("id", id).finish(),
        }
    }
}

/// Driver context the channels write through.
///
/// `epoch` is `Some` exactly while a connection is open. Channels append to
/// `frames`; the driver writes them out after each event.
#[derive(Debug)]
pub(crate) struct Link {
    pub(crate) refs: Arc<RefGenerator>,
    pub(crate) timers: mpsc::UnboundedSender<TimerEvent>,
    pub(crate) epoch: Option<u64>,
    pub(crate) frames: Vec<Message>,
    pub(crate) default_timeout: Duration,
    pub(crate) rejoin_after: Backoff,
}

/// Client side of a Phoenix socket.
///
/// Cheap to clone. The driver task runs until [`shutdown`](Self::shutdown)
/// or until every handle (sockets and channels) has been dropped.
///
/// ```ignore
/// let socket = Socket::new(SocketConfig::new("ws://localhost:4000/socket"))?;
/// socket.connect()?;
/// let lobby = socket.channel("room:lobby").await?;
/// lobby.on("shout", |payload| println!("{payload}"))?;
/// lobby.join(json!({})).receive("ok", |_| println!("joined")).send().await?;
/// ```
#[derive(Debug, Clone)]
pub struct Socket {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    refs: Arc<RefGenerator>,
}

impl Socket {
    /// Create a socket using the WebSocket transport.
    ///
    /// Must be called inside a tokio runtime; the driver task is spawned here.
    /// The socket starts [`ConnectionState::Closed`]; call
    /// [`connect`](Self::connect).
    ///
    /// # Errors
    ///
    /// Returns [`PhoenixError::Config`] if the endpoint is not a valid URL or
    /// a timing is zero.
    pub fn new(config: SocketConfig) -> Result<Self> {
        Self::with_transport(config, WebSocketTransport::new())
    }

    /// Create a socket over a custom [`Transport`].
    ///
    /// # Errors
    ///
    /// Returns [`PhoenixError::Config`] if the endpoint is not a valid URL or
    /// a timing is zero.
    pub fn with_transport(config: SocketConfig, transport: impl Transport) -> Result<Self> {
        config.validate()?;
        let url = config.endpoint_url()?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Closed);
        let refs = Arc::new(RefGenerator::new());

        let driver = Driver::new(
            config,
            url,
            Arc::new(transport),
            Arc::clone(&refs),
            commands_rx,
            state_tx,
        );
        tokio::spawn(driver.run());

        Ok(Self {
            commands: commands_tx,
            state: state_rx,
            refs,
        })
    }

    /// Start connecting. No-op when already open or connecting.
    ///
    /// # Errors
    ///
    /// Returns [`PhoenixError::SocketClosed`] after [`shutdown`](Self::shutdown).
    pub fn connect(&self) -> Result<()> {
        self.send(Command::Connect)
    }

    /// Close the connection without reconnecting.
    ///
    /// Channels that were joined move to `Errored` and rejoin on the next
    /// explicit [`connect`](Self::connect).
    ///
    /// # Errors
    ///
    /// Returns [`PhoenixError::SocketClosed`] after [`shutdown`](Self::shutdown).
    pub async fn disconnect(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(Command::Disconnect { done: done_tx })?;
        done_rx.await.map_err(|_| PhoenixError::SocketClosed)
    }

    /// Disconnect, close every channel and stop the driver task.
    ///
    /// Idempotent.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.send(Command::Shutdown { done: done_tx }).is_ok() {
            // Err means the driver already exited.
            let _ = done_rx.await;
        }
    }

    /// Handle for `topic`, creating the channel on first use.
    ///
    /// # Errors
    ///
    /// Returns [`PhoenixError::SocketClosed`] after [`shutdown`](Self::shutdown).
    pub async fn channel(&self, topic: impl Into<String>) -> Result<ChannelHandle> {
        let topic = topic.into();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Lookup {
            topic: topic.clone(),
            reply: reply_tx,
        })?;
        let state = reply_rx.await.map_err(|_| PhoenixError::SocketClosed)?;
        Ok(ChannelHandle::new(
            topic,
            self.commands.clone(),
            state,
            Arc::clone(&self.refs),
        ))
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether the connection is open.
    pub fn is_connected(&self) -> bool {
        self.state().is_open()
    }

    /// Wait until the connection state satisfies `predicate`, returning it.
    ///
    /// # Errors
    ///
    /// Returns [`PhoenixError::SocketClosed`] if the driver exits first.
    pub async fn wait_for_state<F>(&self, mut predicate: F) -> Result<ConnectionState>
    where
        F: FnMut(&ConnectionState) -> bool,
    {
        let mut rx = self.state.clone();
        let state = rx
            .wait_for(|state| predicate(state))
            .await
            .map_err(|_| PhoenixError::SocketClosed)?;
        Ok(*state)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| PhoenixError::SocketClosed)
    }
}

/// Result of a spawned transport connect.
struct ConnectOutcome {
    generation: u64,
    result: anyhow::Result<Connection>,
}

enum DriverEvent {
    Command(Command),
    HandlesDropped,
    Timer(TimerEvent),
    Connected(ConnectOutcome),
    Inbound(Option<anyhow::Result<Inbound>>),
}

/// Owner of all socket state. Runs on its own task.
struct Driver {
    config: SocketConfig,
    url: Url,
    transport: Arc<dyn Transport>,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    timer_rx: mpsc::UnboundedReceiver<TimerEvent>,
    connect_tx: mpsc::UnboundedSender<ConnectOutcome>,
    connect_rx: mpsc::UnboundedReceiver<ConnectOutcome>,
    link: Link,
    channels: HashMap<String, Channel>,
    /// State senders shared with handles. Outlive channel removal so a
    /// recreated channel keeps publishing to every existing handle.
    states: HashMap<String, Arc<watch::Sender<ChannelState>>>,
    writer: Option<Box<dyn TransportWriter>>,
    reader: Option<Box<dyn TransportReader>>,
    last_epoch: u64,
    heartbeat_timer: Option<Timer>,
    pending_heartbeat: Option<String>,
    reconnect_timer: Option<Timer>,
    reconnect_attempts: u32,
    /// Bumped by `disconnect`; invalidates in-flight connects and reconnect timers.
    generation: u64,
    should_reconnect: bool,
    connecting: bool,
}

impl Driver {
    fn new(
        config: SocketConfig,
        url: Url,
        transport: Arc<dyn Transport>,
        refs: Arc<RefGenerator>,
        commands: mpsc::UnboundedReceiver<Command>,
        state_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        let (timers_tx, timer_rx) = mpsc::unbounded_channel();
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();
        let link = Link {
            refs,
            timers: timers_tx,
            epoch: None,
            frames: Vec::new(),
            default_timeout: config.timeout,
            rejoin_after: config.rejoin_after.clone(),
        };
        Self {
            config,
            url,
            transport,
            commands,
            state_tx,
            timer_rx,
            connect_tx,
            connect_rx,
            link,
            channels: HashMap::new(),
            states: HashMap::new(),
            writer: None,
            reader: None,
            last_epoch: 0,
            heartbeat_timer: None,
            pending_heartbeat: None,
            reconnect_timer: None,
            reconnect_attempts: 0,
            generation: 0,
            should_reconnect: false,
            connecting: false,
        }
    }

    async fn run(mut self) {
        log::debug!("[Socket] Driver started for {}", endpoint_for_log(&self.url));
        loop {
            let event = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => DriverEvent::Command(command),
                    None => DriverEvent::HandlesDropped,
                },
                Some(timer) = self.timer_rx.recv() => DriverEvent::Timer(timer),
                Some(outcome) = self.connect_rx.recv() => DriverEvent::Connected(outcome),
                inbound = recv_inbound(self.reader.as_mut()) => DriverEvent::Inbound(inbound),
            };

            match event {
                DriverEvent::HandlesDropped => {
                    log::debug!("[Socket] All handles dropped");
                    self.shutdown().await;
                    break;
                }
                DriverEvent::Command(command) => {
                    if self.handle_command(command).await.is_break() {
                        break;
                    }
                }
                DriverEvent::Timer(timer) => self.handle_timer(timer),
                DriverEvent::Connected(outcome) => self.handle_connect_outcome(outcome),
                DriverEvent::Inbound(inbound) => self.handle_inbound(inbound),
            }

            self.flush().await;
        }
        log::debug!("[Socket] Driver stopped");
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            log::debug!("[Socket] {} -> {}", previous, state);
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Apply one command. `Break` stops the driver.
    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Connect => self.start_connect(),
            Command::Disconnect { done } => {
                self.disconnect().await;
                let _ = done.send(());
            }
            Command::Shutdown { done } => {
                self.shutdown().await;
                let _ = done.send(());
                return ControlFlow::Break(());
            }
            Command::Lookup { topic, reply } => {
                let state = self.state_sender(&topic, None);
                self.channels
                    .entry(topic.clone())
                    .or_insert_with(|| Channel::new(topic, Arc::clone(&state)));
                let _ = reply.send(state);
            }
            Command::Channel(command) => self.handle_channel_command(command),
        }
        ControlFlow::Continue(())
    }

    /// The topic's shared state sender, registering `fallback` (or a fresh
    /// sender) on first use.
    fn state_sender(
        &mut self,
        topic: &str,
        fallback: Option<Arc<watch::Sender<ChannelState>>>,
    ) -> Arc<watch::Sender<ChannelState>> {
        let state = self.states.entry(topic.to_string()).or_insert_with(|| {
            fallback.unwrap_or_else(|| Arc::new(watch::channel(ChannelState::Closed).0))
        });
        Arc::clone(state)
    }

    fn handle_channel_command(&mut self, command: ChannelCommand) {
        let ChannelCommand { topic, state, op } = command;
        let state = self.state_sender(&topic, Some(state));
        let channel = self
            .channels
            .entry(topic.clone())
            .or_insert_with(|| Channel::new(topic.clone(), state));

        let disposition = match op {
            ChannelOp::Join { push, done } => {
                let _ = done.send(channel.join(push, &mut self.link));
                Disposition::Keep
            }
            ChannelOp::Push { push, done } => {
                channel.push(push, &mut self.link);
                let _ = done.send(Ok(()));
                Disposition::Keep
            }
            ChannelOp::Leave { push, done } => {
                let disposition = channel.leave(push, &mut self.link);
                let _ = done.send(Ok(()));
                disposition
            }
            ChannelOp::On {
                event,
                id,
                callback,
            } => {
                channel.on(&event, id, callback);
                Disposition::Keep
            }
            ChannelOp::Off { event, id } => {
                channel.off(&event, id);
                Disposition::Keep
            }
            ChannelOp::OnAny { id, callback } => {
                channel.on_any(id, callback);
                Disposition::Keep
            }
            ChannelOp::OffAny { id } => {
                channel.off_any(id);
                Disposition::Keep
            }
        };

        if disposition == Disposition::Remove {
            self.remove_channel(&topic);
        }
    }

    fn remove_channel(&mut self, topic: &str) {
        if self.channels.remove(topic).is_some() {
            log::debug!("[Socket] Removed channel {}", topic);
        }
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    fn start_connect(&mut self) {
        if self.writer.is_some() || self.connecting {
            log::debug!("[Socket] Connect ignored: already {}", *self.state_tx.borrow());
            return;
        }
        self.should_reconnect = true;
        if let Some(timer) = self.reconnect_timer.take() {
            timer.cancel();
        }
        self.connecting = true;
        self.set_state(ConnectionState::Connecting);
        log::info!("[Socket] Connecting to {}", endpoint_for_log(&self.url));

        let transport = Arc::clone(&self.transport);
        let url = self.url.clone();
        let outcomes = self.connect_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = transport.connect(&url).await;
            let _ = outcomes.send(ConnectOutcome { generation, result });
        });
    }

    fn handle_connect_outcome(&mut self, outcome: ConnectOutcome) {
        if outcome.generation != self.generation || !self.connecting {
            log::debug!("[Socket] Discarding connect result from a cancelled attempt");
            return;
        }
        self.connecting = false;

        match outcome.result {
            Ok((writer, reader)) => {
                self.last_epoch += 1;
                self.link.epoch = Some(self.last_epoch);
                self.writer = Some(writer);
                self.reader = Some(reader);
                self.reconnect_attempts = 0;
                self.pending_heartbeat = None;
                self.set_state(ConnectionState::Open);
                log::info!("[Socket] Connected");

                self.schedule_heartbeat();
                for channel in self.channels.values_mut() {
                    channel.on_socket_open(&mut self.link);
                }
            }
            Err(e) => {
                log::warn!("[Socket] {}", PhoenixError::Transport(e));
                self.schedule_reconnect();
            }
        }
    }

    /// Connection lost without being asked to close.
    fn transport_down(&mut self, reason: &str) {
        log::warn!("[Socket] Connection lost: {}", reason);
        self.drop_connection();
        self.schedule_reconnect();
    }

    fn drop_connection(&mut self) {
        self.writer = None;
        self.reader = None;
        self.link.epoch = None;
        self.pending_heartbeat = None;
        if let Some(timer) = self.heartbeat_timer.take() {
            timer.cancel();
        }
        self.channels
            .retain(|_, channel| channel.on_socket_down() == Disposition::Keep);
    }

    fn schedule_reconnect(&mut self) {
        if !self.should_reconnect {
            self.set_state(ConnectionState::Closed);
            return;
        }
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        let delay = self.config.reconnect_after.delay(self.reconnect_attempts);
        let next_retry_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        log::warn!(
            "[Socket] Reconnecting in {}ms (attempt {})",
            next_retry_ms,
            self.reconnect_attempts
        );
        self.set_state(ConnectionState::Reconnecting {
            attempt: self.reconnect_attempts,
            next_retry_ms,
        });
        self.reconnect_timer = Some(Timer::schedule(
            &self.link.timers,
            delay,
            TimerEvent::Reconnect {
                generation: self.generation,
            },
        ));
    }

    async fn disconnect(&mut self) {
        self.should_reconnect = false;
        self.generation += 1;
        self.connecting = false;
        self.reconnect_attempts = 0;
        if let Some(timer) = self.reconnect_timer.take() {
            timer.cancel();
        }

        if let Some(mut writer) = self.writer.take() {
            self.set_state(ConnectionState::Closing);
            log::info!("[Socket] Disconnecting");
            match tokio::time::timeout(self.config.timeout, writer.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::debug!("[Socket] Close failed: {:#}", e),
                Err(_) => log::debug!("[Socket] Close timed out"),
            }
        }
        self.drop_connection();
        self.set_state(ConnectionState::Closed);
    }

    async fn shutdown(&mut self) {
        log::info!("[Socket] Shutting down");
        self.disconnect().await;
        for (_, mut channel) in self.channels.drain() {
            channel.close_for_shutdown();
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn handle_timer(&mut self, timer: TimerEvent) {
        match timer {
            TimerEvent::Heartbeat { epoch } => self.heartbeat_tick(epoch),
            TimerEvent::Reconnect { generation } => {
                if generation != self.generation || !self.should_reconnect {
                    log::trace!("[Socket] Stale reconnect timer");
                    return;
                }
                self.reconnect_timer = None;
                self.start_connect();
            }
            TimerEvent::PushTimeout { topic, msg_ref } => {
                let Some(channel) = self.channels.get_mut(&topic) else {
                    return;
                };
                if channel.handle_timeout(&msg_ref, &mut self.link) == Disposition::Remove {
                    self.remove_channel(&topic);
                }
            }
            TimerEvent::Rejoin { topic, generation } => {
                if let Some(channel) = self.channels.get_mut(&topic) {
                    channel.handle_rejoin_timer(generation, &mut self.link);
                }
            }
        }
    }

    fn schedule_heartbeat(&mut self) {
        let Some(epoch) = self.link.epoch else {
            return;
        };
        self.heartbeat_timer = Some(Timer::schedule(
            &self.link.timers,
            self.config.heartbeat_interval,
            TimerEvent::Heartbeat { epoch },
        ));
    }

    fn heartbeat_tick(&mut self, epoch: u64) {
        if self.link.epoch != Some(epoch) {
            log::trace!("[Socket] Stale heartbeat timer");
            return;
        }
        self.heartbeat_timer = None;

        if let Some(unanswered) = self.pending_heartbeat.take() {
            self.transport_down(&format!("heartbeat {unanswered} not answered"));
            return;
        }

        let msg_ref = self.link.refs.next();
        log::trace!("[Socket] Heartbeat (ref={})", msg_ref);
        self.pending_heartbeat = Some(msg_ref.clone());
        self.link.frames.push(Message::heartbeat(msg_ref));
        self.schedule_heartbeat();
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    fn handle_inbound(&mut self, inbound: Option<anyhow::Result<Inbound>>) {
        match inbound {
            Some(Ok(Inbound::Text(text))) => self.route(&text),
            Some(Ok(Inbound::Closed { code, reason })) => {
                log::info!("[Socket] Server closed connection (code={}, reason={:?})", code, reason);
                self.transport_down("closed by server");
            }
            Some(Err(e)) => {
                self.transport_down(&PhoenixError::Transport(e).to_string());
            }
            None => self.transport_down("stream ended"),
        }
    }

    fn route(&mut self, text: &str) {
        log::trace!("[Socket] <- {}", text);
        let message = match message::decode(text) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("[Socket] Dropping frame ({}): {}", e, preview(text));
                return;
            }
        };

        if message.topic == PHOENIX_TOPIC {
            if message.event == Event::Reply && message.msg_ref.is_some() && message.msg_ref == self.pending_heartbeat {
                self.pending_heartbeat = None;
            }
            return;
        }

        let Some(channel) = self.channels.get_mut(&message.topic) else {
            log::debug!(
                "[Socket] Dropping '{}' for unknown topic {}",
                message.event,
                message.topic
            );
            return;
        };
        let awaited_reply = message.event == Event::Reply
            && message
                .msg_ref
                .as_deref()
                .is_some_and(|msg_ref| channel.awaits_reply(msg_ref));
        if !awaited_reply && !channel.is_member(message.join_ref.as_deref()) {
            log::debug!(
                "[Socket] Dropping stale '{}' on {} (join_ref={:?})",
                message.event,
                message.topic,
                message.join_ref
            );
            return;
        }

        let disposition = match &message.event {
            Event::Reply => {
                let Some(msg_ref) = message.msg_ref.as_deref() else {
                    log::warn!("[Socket] Dropping reply without ref on {}", message.topic);
                    return;
                };
                match Reply::from_payload(&message.payload) {
                    Ok(reply) => channel.handle_reply(msg_ref, &reply, &mut self.link),
                    Err(e) => {
                        log::warn!("[Socket] Dropping reply on {}: {}", message.topic, e);
                        return;
                    }
                }
            }
            Event::Error => {
                channel.handle_error(&mut self.link);
                Disposition::Keep
            }
            Event::Close => channel.handle_server_close(),
            _ => {
                channel.dispatch(&message);
                Disposition::Keep
            }
        };

        if disposition == Disposition::Remove {
            self.remove_channel(&message.topic);
        }
    }

    /// Write frames queued by the last event.
    async fn flush(&mut self) {
        if self.link.frames.is_empty() {
            return;
        }
        let frames = std::mem::take(&mut self.link.frames);
        let Some(writer) = self.writer.as_mut() else {
            log::debug!("[Socket] Not connected; dropping {} frame(s)", frames.len());
            return;
        };

        let mut failure = None;
        for frame in &frames {
            let text = match message::encode(frame) {
                Ok(text) => text,
                Err(e) => {
                    log::warn!("[Socket] Failed to encode '{}' on {}: {}", frame.event, frame.topic, e);
                    continue;
                }
            };
            log::trace!("[Socket] -> {}", text);
            if let Err(e) = writer.send_text(&text).await {
                failure = Some(e);
                break;
            }
        }

        if let Some(e) = failure {
            self.transport_down(&format!("send failed: {e:#}"));
        }
    }
}

async fn recv_inbound(
    reader: Option<&mut Box<dyn TransportReader>>,
) -> Option<anyhow::Result<Inbound>> {
    match reader {
        Some(reader) => reader.recv().await,
        None => std::future::pending().await,
    }
}

/// Endpoint without its query string, which may carry credentials.
fn endpoint_for_log(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

/// First 100 characters of a frame, for logs.
fn preview(text: &str) -> String {
    text.chars().take(100).collect()
}
