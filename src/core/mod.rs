// Core protocol types shared by every subsystem:
//
// - `node`: node identity, status, and descriptor records
// - `message`: the typed protocol messages and the wire codec
// - `checksum`: canonical-form integrity digests
// - `result`: query results as returned to clients

pub mod checksum;
pub mod message;
pub mod node;
pub mod result;

pub use message::{CommunicationType, Message, Payload};
pub use node::{NodeDescriptor, NodeId, NodeStatus, CLIENT_SENDER_ID};
pub use result::QueryResult;
