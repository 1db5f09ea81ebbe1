//! Data structures for the RPC interface, shared between client and server.

pub mod fault;
pub mod ids;
pub mod member;
pub mod rpc;
pub mod serde_ext;
pub mod token;
