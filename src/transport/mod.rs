//! Engine transports: one request contract, two wire framings.

mod http;
mod protocol;
mod stdio;
mod types;

pub use http::*;
pub use protocol::*;
pub use stdio::*;
pub use types::*;
