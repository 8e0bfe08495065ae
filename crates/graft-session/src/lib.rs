//! Multiplexed sessions with embeddable, flow-controlled channels.
//!
//! A [`Session`] carries any number of independent [`Channel`]s over one
//! transport. Channels, and external streams or sinks, can be placed inside
//! a [`Message`] like any other value; the receiving session hands out a
//! live channel wired back to the sender.
//!
//! Sessions compose: [`Session::pipe_into`] forwards one session's messages
//! into another while keeping the session and channel they came from.

pub mod channel;
pub mod config;
pub mod control;
pub mod embed;
pub mod error;
pub mod message;
pub mod relay;
pub mod session;
pub mod value;

mod mux;
mod registry;
mod wire;

#[cfg(unix)]
pub mod connector;
#[cfg(unix)]
pub mod listener;

pub use channel::{Channel, ChannelState, Direction};
pub use config::{SessionConfig, DEFAULT_CHANNEL_WINDOW, DEFAULT_CLOSE_TIMEOUT, DEFAULT_OUTBOUND_QUEUE};
pub use control::ControlOp;
pub use embed::Embed;
pub use error::{ChannelError, Result, SessionError};
pub use message::{Message, Provenance, SessionId};
pub use relay::RelayHandle;
pub use session::Session;
pub use value::Value;

#[cfg(unix)]
pub use connector::{connect, connect_with_config};
#[cfg(unix)]
pub use listener::SessionListener;
