//! Engine child process management: spawning, output framing, log parsing.

mod lines;
mod logs;
mod process;

pub use lines::*;
pub use logs::*;
pub use process::*;
