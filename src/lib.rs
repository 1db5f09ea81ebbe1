//! The _Token Signer_ library crate.
//!
//! The signer owns all private key material of a security server. It keeps
//! track of tokens, keys, certificates and certificate requests, talks to
//! software and PKCS#11 devices, and offers its functionality to other
//! processes through a small RPC interface.

pub mod api;
pub mod cli;
pub mod commons;
pub mod config;
pub mod constants;
pub mod device;
pub mod manager;
pub mod ocsp;
pub mod registry;
pub mod server;
pub mod service;
