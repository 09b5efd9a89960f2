//! The request handler boundary.
//!
//! A [`Handler`] is called on the connection's task with the parsed request
//! and a [`Responder`]. It may answer right away or move the responder to
//! another task or thread and answer later; the response is routed back to
//! the connection through the registry and written in request order.
//!
//! A response can also be produced in parts: [`Responder::chunked`] and
//! [`Responder::user_controlled`] send the head and return a
//! [`ResponseStream`] for the body.

use std::sync::Arc;

use bytes::Bytes;

use tracing::trace;

use crate::http::request::Request;
use crate::http::response::Response;
use crate::registry::{ConnectionEvent, ConnectionHandle, ConnectionRegistry, Stale};
use crate::ws::handshake::{self, HandshakeError};
use crate::ws::message::WsHandler;

/// Whether a handler took responsibility for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handling {
    Accepted,
    /// Answered with 501 Not Implemented.
    Rejected,
}

pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: Request, responder: Responder) -> Handling;
}

impl<F> Handler for F
where
    F: Fn(Request, Responder) -> Handling + Send + Sync + 'static,
{
    fn handle(&self, request: Request, responder: Responder) -> Handling {
        self(request, responder)
    }
}

/// Progress of a response produced in parts.
#[derive(Debug)]
pub enum StreamPart {
    /// Status line and fields. A body set on the head is its first part.
    Head { response: Response, chunked: bool },
    Data(Bytes),
    Finish,
}

/// Completes one request slot. Dropping it unanswered yields a 500.
pub struct Responder {
    registry: Arc<ConnectionRegistry>,
    connection: ConnectionHandle,
    seq: u64,
    done: bool,
}

impl Responder {
    pub fn new(registry: Arc<ConnectionRegistry>, connection: ConnectionHandle, seq: u64) -> Self {
        Self {
            registry,
            connection,
            seq,
            done: false,
        }
    }

    /// Sequence number of the request within its connection.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Sends the response. Fails if the connection is already gone.
    pub fn respond(mut self, response: Response) -> Result<(), Stale> {
        self.done = true;
        self.registry.dispatch(
            self.connection,
            ConnectionEvent::Response {
                seq: self.seq,
                response,
                upgrade: None,
            },
        )
    }

    /// Starts a response whose body follows in parts, sent with
    /// `Transfer-Encoding: chunked`. HTTP/1.0 peers get the parts unframed
    /// and the connection closes after the last one.
    pub fn chunked(self, head: Response) -> Result<ResponseStream, Stale> {
        self.stream(head, true)
    }

    /// Starts a response whose body parts are written exactly as given. The
    /// head should carry the `Content-Length` of the whole body; without one
    /// the connection closes after the last part.
    pub fn user_controlled(self, head: Response) -> Result<ResponseStream, Stale> {
        self.stream(head, false)
    }

    fn stream(mut self, response: Response, chunked: bool) -> Result<ResponseStream, Stale> {
        self.done = true;
        let stream = ResponseStream {
            registry: Arc::clone(&self.registry),
            connection: self.connection,
            seq: self.seq,
            finished: false,
        };
        stream.dispatch(StreamPart::Head { response, chunked })?;
        Ok(stream)
    }

    /// Accepts a WebSocket upgrade. Once every earlier response has been
    /// written the connection answers 101 and hands itself to `handler`.
    /// An invalid upgrade request is answered with 400 and the error is
    /// returned.
    pub fn upgrade<H: WsHandler>(mut self, request: &Request, handler: H) -> Result<(), HandshakeError> {
        self.done = true;

        let event = match handshake::switching_protocols(request) {
            Ok(response) => ConnectionEvent::Response {
                seq: self.seq,
                response,
                upgrade: Some(Box::new(handler)),
            },
            Err(e) => {
                let _ = self.registry.dispatch(
                    self.connection,
                    ConnectionEvent::Response {
                        seq: self.seq,
                        response: Response::bad_request(),
                        upgrade: None,
                    },
                );
                return Err(e);
            }
        };

        self.registry
            .dispatch(self.connection, event)
            .map_err(|_| HandshakeError::ConnectionClosed)
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        trace!(seq = self.seq, "responder dropped without a response");
        let _ = self
            .registry
            .dispatch(self.connection, ConnectionEvent::Abandoned { seq: self.seq });
    }
}

/// Body of a response sent in parts.
///
/// Parts are written in the order they are sent, once every earlier response
/// of the connection is out. Dropping the stream before
/// [`ResponseStream::finish`] closes the connection after the parts sent so
/// far.
pub struct ResponseStream {
    registry: Arc<ConnectionRegistry>,
    connection: ConnectionHandle,
    seq: u64,
    finished: bool,
}

impl ResponseStream {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn send_part(&mut self, data: impl Into<Bytes>) -> Result<(), Stale> {
        let data = data.into();
        // an empty chunk would end a chunked body
        if data.is_empty() {
            return Ok(());
        }
        self.dispatch(StreamPart::Data(data))
    }

    /// Ends the response.
    pub fn finish(mut self) -> Result<(), Stale> {
        self.finished = true;
        self.dispatch(StreamPart::Finish)
    }

    fn dispatch(&self, part: StreamPart) -> Result<(), Stale> {
        self.registry
            .dispatch(self.connection, ConnectionEvent::Stream { seq: self.seq, part })
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        trace!(seq = self.seq, "response stream dropped before its end");
        let _ = self
            .registry
            .dispatch(self.connection, ConnectionEvent::Abandoned { seq: self.seq });
    }
}
