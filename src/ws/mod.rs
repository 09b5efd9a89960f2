//! WebSocket (RFC 6455) on top of an upgraded HTTP connection.
//!
//! - **`handshake`**: validates the upgrade request and builds the 101 response
//! - **`frame`**: opcodes, frame header, masking and server-side encoding
//! - **`parser`**: incremental frame decoder
//! - **`validator`**: fragmentation, control frame, masking and UTF-8 rules
//! - **`utf8`**: streaming UTF-8 checker used by the validator
//! - **`message`**: what user code sees: messages, close codes, handler and handle
//! - **`connection`**: the per-connection loop after the upgrade

pub mod connection;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod parser;
pub mod utf8;
pub mod validator;

pub use message::{CloseCode, Message, WsHandle, WsHandler};
