//! Engine Supervisor - keeps an external engine process alive and multiplexes
//! requests to it over stdio JSON-RPC or HTTP on a local socket.

pub mod config;
pub mod engine;
pub mod error;
pub mod supervisor;
pub mod transport;
