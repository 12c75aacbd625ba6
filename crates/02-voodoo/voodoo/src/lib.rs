//! Voodoo: method calls on registered instances across a byte stream.
//!
//! A [`Manager`] owns one connection. Either side registers instances,
//! looks up the peer's named roots and sends requests; a [`Server`] accepts
//! connections and gives each its own manager. [`bridge`] carries fusion
//! calls over a connection.

pub mod bridge;
mod config;
mod error;
mod instance;
mod link;
mod manager;
mod message;
pub mod packet;
mod server;

pub use bridge::{export_call, RemoteCall};
pub use config::{VoodooConfig, DEFAULT_MAX_PACKET_SIZE};
pub use error::{VoodooError, VoodooResult};
pub use instance::{Dispatch, DispatchTable, Invocation, SuperRegistry};
pub use link::Link;
pub use manager::{ConnectionState, Manager, Response, LOOKUP_SUPER};
pub use message::{
    ArgReader, ArgWriter, InstanceId, Message, MessageFlags, MessageKind, MethodId,
    MESSAGE_HEADER, PROTOCOL_VERSION, SUPER_INSTANCE,
};
pub use packet::{Compression, PacketHeader};
pub use server::Server;
