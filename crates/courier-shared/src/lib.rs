//! Domain types and the real-time transport protocol shared by the courier
//! server crates.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use types::*;
