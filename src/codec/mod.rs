//! Codec module - wire framing and message processors.
//!
//! Two layers live here:
//!
//! - [`FrameCodec`] - the length-prefix framing every TCP connection uses.
//! - [`Processor`] implementations - the id/type registry plus the
//!   encode/decode/route triple that turns framed payloads into application
//!   messages:
//!   - [`ProtoProcessor`] - binary `[id:u16][protobuf bytes]` payloads.
//!   - [`JsonProcessor`] - single-key JSON envelopes `{"TypeName": {...}}`.
//!
//! # Design
//!
//! Registries are built during startup and treated read-only once messages
//! flow. Registration captures monomorphized encode/decode closures per
//! message type, keyed by `TypeId`; dispatch never touches reflection at
//! runtime.

mod frame;
mod json;
mod proto;

use std::any::Any;

use bytes::Bytes;

use crate::error::Result;

pub use frame::{ByteOrder, FrameCodec, LenWidth};
pub use json::JsonProcessor;
pub use proto::ProtoProcessor;

/// A decoded message value. Handlers downcast to the concrete type they
/// registered.
pub use crate::chanrpc::Value;

/// Opaque per-message user data (typically the connection's agent handle).
pub type UserData = Box<dyn Any + Send>;

/// Wire identifier of a message: numeric for the binary processor, the type
/// name for the text processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageId {
    /// Dense numeric id assigned at registration (binary processor).
    Id(u16),
    /// Declared type name (text processor).
    Name(String),
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageId::Id(id) => write!(f, "{id}"),
            MessageId::Name(name) => f.write_str(name),
        }
    }
}

/// A wire message whose id is registered for passthrough; delivered without
/// decoding.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// The wire identifier.
    pub id: MessageId,
    /// The undecoded payload (past the id for the binary processor, the
    /// envelope value for the text processor).
    pub data: Bytes,
}

/// Result of [`Processor::unmarshal`].
#[derive(Debug)]
pub enum Message {
    /// Raw passthrough for ids with a raw handler installed.
    Raw(RawMessage),
    /// A decoded message value.
    Typed(Value),
}

/// Synchronous message handler: `(msg, user_data)`. Runs on the reader task
/// of the connection that produced the message.
pub type MsgHandler = Box<dyn Fn(&dyn Any, &UserData) + Send + Sync>;

/// Raw-passthrough handler: `(raw, user_data)`.
pub type RawHandler = Box<dyn Fn(&RawMessage, &UserData) + Send + Sync>;

/// The encode/decode/route contract shared by both codecs.
///
/// All methods must be callable from any task.
pub trait Processor: Send + Sync {
    /// Decode one framed payload into a message (or a raw passthrough).
    fn unmarshal(&self, data: &[u8]) -> Result<Message>;

    /// Deliver a decoded message to its destination: the raw handler for
    /// passthrough entries, otherwise the synchronous handler and/or the
    /// entry's chanrpc router. Both fire when both are configured.
    fn route(&self, msg: Message, user_data: UserData) -> Result<()>;

    /// Encode a message into wire parts, to be written as one framed
    /// message.
    fn marshal(&self, msg: &dyn Any) -> Result<Vec<Bytes>>;
}
