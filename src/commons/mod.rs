//! Common types used by the various signer components.

pub mod error;
pub mod file;

#[cfg(test)]
pub mod test;

//------------ Response Aliases ----------------------------------------------

pub type SignerEmptyResult = std::result::Result<(), self::error::Error>;
pub type SignerResult<T> = std::result::Result<T, self::error::Error>;
