// Networking layer: newline-framed JSON messages over TCP.
//
// - `server`: accept loop and per-connection frame readers
// - `client`: outbound sends with unicast/broadcast/multicast dispatch

pub mod client;
pub mod server;

pub use client::{MessageClient, NetworkOutbound, Outbound};
pub use server::{MessageHandler, MessageServer, Reply};
