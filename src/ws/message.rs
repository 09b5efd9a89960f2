use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::registry::{ConnectionEvent, ConnectionHandle, ConnectionRegistry, Stale};
use crate::ws::frame::Opcode;

/// WebSocket close status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    pub const NORMAL: CloseCode = CloseCode(1000);
    pub const GOING_AWAY: CloseCode = CloseCode(1001);
    pub const PROTOCOL_ERROR: CloseCode = CloseCode(1002);
    pub const UNSUPPORTED_DATA: CloseCode = CloseCode(1003);
    /// Never sent; reported locally when a close frame had no status.
    pub const NO_STATUS: CloseCode = CloseCode(1005);
    /// Never sent; reported locally when the stream ended without a close frame.
    pub const ABNORMAL: CloseCode = CloseCode(1006);
    pub const INVALID_DATA: CloseCode = CloseCode(1007);
    pub const POLICY_VIOLATION: CloseCode = CloseCode(1008);
    pub const TOO_BIG: CloseCode = CloseCode(1009);
    pub const INTERNAL_ERROR: CloseCode = CloseCode(1011);

    /// Statuses a peer may put in a close frame.
    pub fn is_allowed_on_wire(&self) -> bool {
        matches!(self.0, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One frame as seen by user code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Bytes,
}

impl Message {
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode,
            payload: payload.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Opcode::Text, text.into())
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Binary, payload)
    }

    /// Marks the message as the first or a middle piece of a fragmented one.
    pub fn partial(mut self) -> Self {
        self.fin = false;
        self
    }

    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Receives the events of an upgraded connection. Runs on the connection's
/// task; keep it short and clone the handle for work elsewhere.
pub trait WsHandler: Send + 'static {
    fn on_open(&mut self, _handle: &WsHandle) {}

    /// Every data frame, and pings and pongs (pings are answered already).
    fn on_message(&mut self, handle: &WsHandle, message: Message);

    /// Called exactly once, whatever ended the connection.
    fn on_close(&mut self, _code: CloseCode, _reason: &str) {}
}

impl<F> WsHandler for F
where
    F: FnMut(&WsHandle, Message) + Send + 'static,
{
    fn on_message(&mut self, handle: &WsHandle, message: Message) {
        self(handle, message)
    }
}

/// Sends to an upgraded connection from anywhere.
#[derive(Debug, Clone)]
pub struct WsHandle {
    registry: Arc<ConnectionRegistry>,
    connection: ConnectionHandle,
    id: u64,
}

impl WsHandle {
    pub fn new(registry: Arc<ConnectionRegistry>, connection: ConnectionHandle, id: u64) -> Self {
        Self {
            registry,
            connection,
            id,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn send(&self, message: Message) -> Result<(), Stale> {
        self.registry
            .dispatch(self.connection, ConnectionEvent::WsSend(message))
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), Stale> {
        self.send(Message::text(text))
    }

    pub fn send_binary(&self, payload: impl Into<Bytes>) -> Result<(), Stale> {
        self.send(Message::binary(payload))
    }

    /// Starts the closing handshake.
    pub fn close(&self, code: CloseCode, reason: impl Into<String>) -> Result<(), Stale> {
        self.registry.dispatch(
            self.connection,
            ConnectionEvent::WsClose {
                code,
                reason: reason.into(),
            },
        )
    }

    pub fn is_open(&self) -> bool {
        self.registry.is_live(self.connection)
    }
}
