//! Mesh overlay protocol reference implementation.
//! Host-driven: no I/O; the host passes transport events and receives actions.

pub mod base58;
pub mod codec;
pub mod compression;
pub mod connection;
pub mod envelope;
pub mod handler;
pub mod identity;
pub mod mesh;
pub mod protocol;

pub use base58::{from_base58, to_base58, Base58Error};
pub use codec::{pack_value, unpack_value, CodecError};
pub use compression::{CompressionError, Method, Registry};
pub use connection::{Action, ConnId, Connection, MAX_FRAME_LEN};
pub use envelope::{Envelope, EnvelopeError};
pub use handler::MessageHandler;
pub use identity::{MessageId, NodeId, ID_LEN};
pub use mesh::{ConnectError, Delivery, MeshNode, MAX_OUTGOING};
pub use protocol::{flag, subflag, PeerAddr, Protocol, PROTOCOL_VERSION};
