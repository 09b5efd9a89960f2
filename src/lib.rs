//! Strand - embeddable HTTP/WebSocket server engine
//!
//! Per-connection protocol state machines: pipelined HTTP/1.x exchanges with
//! ordered responses, timeout-guarded I/O, zero-copy file transmission and an
//! RFC 6455 framing layer that reuses the same connection.

pub mod config;
pub mod http;
pub mod registry;
pub mod server;
pub mod settings;
pub mod timer;
pub mod transport;
pub mod ws;
