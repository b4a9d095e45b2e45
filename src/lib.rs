#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![deny(unused_must_use)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod actor;
pub mod binding;
pub mod capability;
pub mod channel;
pub mod client;
pub mod codec;
pub mod directory;
pub mod error;
pub mod event;
pub mod framing;
pub mod gateway;
pub mod mailbox;
pub mod message;
pub mod observer;
pub mod packet;
pub mod session;
pub mod transport;

pub use actor::{spawn, Actor, ActorId, ActorRef};
pub use binding::{BindingFlags, BindingId, BindingSpec};
pub use capability::{Capability, CapabilityCatalog, Interface};
pub use channel::{Channel, ChannelId};
pub use client::ChannelClient;
pub use gateway::{Gateway, GatewayBuilder, GatewayConfig};
pub use session::ReconnectToken;
pub use transport::TransportKind;
