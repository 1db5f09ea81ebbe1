//! The signer command line client.

pub mod client;
pub mod httpcli;
pub mod options;
pub mod report;

pub use self::client::SignerClient;
pub use self::httpcli::Error;
