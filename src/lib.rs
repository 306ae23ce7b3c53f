//! Phoenix Channels client.
//!
//! Multiplexes any number of topic-scoped channels over one persistent
//! connection to a Phoenix server, correlating each push with its reply,
//! keeping the connection alive with heartbeats and recovering from drops by
//! reconnecting and rejoining automatically.
//!
//! # Architecture
//!
//! A [`Socket`] owns a background driver task that is the single owner of all
//! connection, channel and push state. [`ChannelHandle`] and [`PushBuilder`]
//! are thin handles that queue commands to it.
//!
//! - **Socket** - connection lifecycle, heartbeat, reconnect, inbound routing
//! - **Channel** - per-topic join/leave state machine, buffering, rejoin
//! - **Push** - one request, resolved once by reply, timeout or abandonment
//! - **Transport** - pluggable text-frame connection (WebSocket by default)
//!
//! # Modules
//!
//! - [`message`] - wire frame codec (`[join_ref, ref, topic, event, payload]`)
//! - [`socket`] - [`Socket`] and the driver task
//! - [`channel`] - [`ChannelHandle`] and channel states
//! - [`push`] - [`PushBuilder`] and reply statuses
//! - [`config`] - [`SocketConfig`] and [`Backoff`] schedules
//! - [`transport`] - [`Transport`](transport::Transport) traits and the WebSocket implementation

// Library modules
pub mod bindings;
pub mod channel;
pub mod config;
pub mod error;
pub mod message;
pub mod push;
pub mod reference;
pub mod socket;
pub mod transport;

mod timer;

// Re-export commonly used types
pub use bindings::SubscriptionRef;
pub use channel::{ChannelHandle, ChannelState};
pub use config::{Backoff, SocketConfig};
pub use error::{PhoenixError, Result};
pub use message::{Event, Message, Reply};
pub use push::PushBuilder;
pub use socket::{ConnectionState, Socket};
