//! Miscellaneous common structs used throughout the library.

mod closest_nodes;
mod id;
pub mod identity;
pub mod messages;
mod node;
pub(crate) mod record;
mod routing_table;

pub use closest_nodes::*;
pub use id::*;
pub use identity::{Ed25519Identity, IdentityScheme};
pub use messages::{Message, MessageError, MessageFactory, MessageKind};
pub use node::*;
pub use record::{PeerRecord, PeerRecordBuilder, RecordError, MAX_RECORD_SIZE};
pub use routing_table::*;
