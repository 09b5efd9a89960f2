use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::Context as _;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::http::handler::{Handling, Responder, StreamPart};
use crate::http::output::{OutputCoordinator, OutputItem, PendingKind, ResponseEnd, drive_output};
use crate::http::parser::{ParseError, RequestParser};
use crate::http::pipeline::{PipelineQueue, RequestInfo, SlotStatus};
use crate::http::request::{Method, Request};
use crate::http::response::{Body, Response};
use crate::http::writer::{ConnectionAttr, Framing, body_part_items, last_chunk, response_items, serialize_head_framed};
use crate::registry::{ConnectionEvent, Registration, next_connection_id};
use crate::settings::ConnectionSettings;
use crate::timer::{Expired, TimeoutGuard, TimeoutKind};
use crate::transport::Transport;
use crate::ws::connection::{Upgraded, WsConnection};
use crate::ws::message::WsHandler;

/// Serialized response part of one slot, waiting for its turn. `close` and
/// `upgrade` only matter on the final part.
struct Outgoing {
    items: Vec<OutputItem>,
    close: bool,
    upgrade: Option<Box<dyn WsHandler>>,
}

impl Outgoing {
    fn part(items: Vec<OutputItem>) -> Self {
        Self {
            items,
            close: false,
            upgrade: None,
        }
    }
}

/// A response whose body is still being produced.
#[derive(Debug, Clone, Copy)]
struct OpenStream {
    chunked: bool,
    /// False for HEAD requests and bodiless statuses.
    with_body: bool,
    close: bool,
}

enum Exit {
    /// Orderly close after everything queued has been written.
    Close,
    /// Drop the transport without flushing.
    Abort,
    Upgrade(Box<dyn WsHandler>),
}

/// One HTTP/1.x connection.
///
/// The whole state lives in the task running [`Connection::run`]. Handler
/// completions and timer expirations arrive as [`ConnectionEvent`]s through
/// the registry.
///
/// ```text
///   reading ──request──▶ dispatch ──▶ awaiting handler ──▶ handler complete
///      ▲                    │ (depth allows)                      │
///      └────────────────────┘                                     ▼
///      ▲                                                  writing, in order
///      └────────────── keep-alive ◀───────────────────────────────┤
///                                      close / upgrade ◀──────────┘
/// ```
pub struct Connection<T: Transport> {
    id: u64,
    registration: Registration,
    transport: T,
    settings: Arc<ConnectionSettings>,
    input: BytesMut,
    parser: RequestParser,
    guard: TimeoutGuard,
    pipeline: PipelineQueue<Outgoing>,
    streams: HashMap<u64, OpenStream>,
    output: OutputCoordinator,
    events: UnboundedReceiver<ConnectionEvent>,
    deferred: VecDeque<ConnectionEvent>,
    idle_since: Instant,
    last_write: Instant,
    read_closed: bool,
    stop_reading: bool,
    terminal_queued: bool,
    upgrade_pending: Option<u64>,
}

impl<T: Transport> Connection<T> {
    pub fn new(transport: T, settings: Arc<ConnectionSettings>) -> Self {
        let (registration, events) = settings.registry.register();
        let connection = &settings.connection;

        Self {
            id: next_connection_id(),
            registration,
            transport,
            input: BytesMut::with_capacity(connection.buffer_size),
            parser: RequestParser::new(settings.parse_limits()),
            guard: TimeoutGuard::new(),
            pipeline: PipelineQueue::new(connection.max_pipelined_requests),
            streams: HashMap::new(),
            output: OutputCoordinator::default(),
            events,
            deferred: VecDeque::new(),
            idle_since: Instant::now(),
            last_write: Instant::now(),
            read_closed: false,
            stop_reading: false,
            terminal_queued: false,
            upgrade_pending: None,
            settings,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Serves requests until the connection closes, then hands upgraded
    /// connections to the WebSocket layer.
    pub async fn run(mut self) -> anyhow::Result<()> {
        debug!(connection = self.id, "connection started");

        let exit = self.serve().await;
        self.guard.cancel();

        match exit? {
            Exit::Close => {
                let limit = self.settings.connection.write_http_response_timelimit;
                let _ = tokio::time::timeout(limit, self.transport.shutdown()).await;
                debug!(connection = self.id, "connection closed");
                Ok(())
            }
            Exit::Abort => {
                debug!(connection = self.id, "connection aborted");
                Ok(())
            }
            Exit::Upgrade(handler) => {
                debug!(connection = self.id, "switching to websocket");
                let Connection {
                    id,
                    registration,
                    transport,
                    settings,
                    input,
                    events,
                    ..
                } = self;
                let upgraded = Upgraded {
                    id,
                    registration,
                    transport,
                    settings,
                    input,
                    events,
                };
                WsConnection::new(upgraded, handler).run().await
            }
        }
    }

    async fn serve(&mut self) -> anyhow::Result<Exit> {
        loop {
            while let Some(event) = self.deferred.pop_front() {
                if let Some(exit) = self.on_event(event) {
                    return Ok(exit);
                }
            }

            self.process_input();
            self.drain_pipeline();

            if self.output.has_pending() {
                if let Some(exit) = self.write_output().await? {
                    return Ok(exit);
                }
                continue;
            }

            if let Some(exit) = self.take_finished() {
                return Ok(exit);
            }
            if self.read_closed && self.pipeline.is_empty() {
                debug!(connection = self.id, "peer finished sending");
                return Ok(Exit::Close);
            }

            self.rearm_waiting_timer();

            if self.can_read() {
                self.input.reserve(self.settings.connection.buffer_size);
                tokio::select! {
                    biased;
                    event = self.events.recv() => match event {
                        Some(event) => {
                            if let Some(exit) = self.on_event(event) {
                                return Ok(exit);
                            }
                        }
                        None => return Ok(Exit::Abort),
                    },
                    read = self.transport.read_buf(&mut self.input) => {
                        let n = read.context("read failed")?;
                        if n == 0 {
                            self.read_closed = true;
                        } else {
                            trace!(connection = self.id, bytes = n, "read");
                        }
                    }
                }
            } else {
                match self.events.recv().await {
                    Some(event) => {
                        if let Some(exit) = self.on_event(event) {
                            return Ok(exit);
                        }
                    }
                    None => return Ok(Exit::Abort),
                }
            }
        }
    }

    /// Parses buffered requests while the pipeline admits them.
    fn process_input(&mut self) {
        while self.accepting_requests() && !self.input.is_empty() {
            match self.parser.parse(&self.input) {
                Ok((request, consumed)) => {
                    self.input.advance(consumed);
                    self.dispatch(request);
                }
                Err(ParseError::Incomplete) => break,
                Err(error) => {
                    self.reject(error);
                    break;
                }
            }
        }
    }

    fn dispatch(&mut self, request: Request) {
        let keep_alive = request.keep_alive();
        let info = RequestInfo {
            version: request.version,
            head: request.method == Method::HEAD,
            upgrade: request.is_upgrade(),
        };

        let Some(seq) = self.pipeline.push(keep_alive, info) else {
            warn!(connection = self.id, "pipeline full, request dropped");
            return;
        };
        debug!(
            connection = self.id,
            seq,
            method = %request.method,
            target = %request.target,
            "request received"
        );

        if info.upgrade {
            self.upgrade_pending = Some(seq);
        }

        let responder = Responder::new(
            Arc::clone(self.registration.registry()),
            self.registration.handle(),
            seq,
        );
        if self.settings.handler.handle(request, responder) == Handling::Rejected {
            debug!(connection = self.id, seq, "handler rejected the request");
            self.complete(seq, Response::not_implemented(), None);
        }
    }

    /// Answers unparsable input and stops reading.
    fn reject(&mut self, error: ParseError) {
        warn!(connection = self.id, %error, "malformed request");
        self.stop_reading = true;
        self.input.clear();
        self.parser.reset();

        if let Some(seq) = self.pipeline.push(false, RequestInfo::default()) {
            self.complete(seq, Response::terminal(error.status()), None);
        }
    }

    fn complete(&mut self, seq: u64, mut response: Response, mut upgrade: Option<Box<dyn WsHandler>>) {
        let Some(slot) = self.pipeline.get(seq) else {
            trace!(connection = self.id, seq, "response for a finished request ignored");
            return;
        };
        if slot.status != SlotStatus::AwaitingHandler {
            trace!(connection = self.id, seq, "request already answered");
            return;
        }
        let (info, keep_alive) = (slot.info, slot.keep_alive);

        if upgrade.is_some() && !info.upgrade {
            warn!(connection = self.id, seq, "upgrade accepted for a plain request");
            upgrade = None;
            response = Response::internal_error();
        }
        if self.upgrade_pending == Some(seq) && upgrade.is_none() {
            self.upgrade_pending = None;
        }

        let attr = if upgrade.is_some() {
            ConnectionAttr::Upgrade
        } else if !keep_alive || response.close {
            ConnectionAttr::Close
        } else {
            ConnectionAttr::KeepAlive
        };
        if attr == ConnectionAttr::Close {
            self.stop_reading = true;
        }

        debug!(connection = self.id, seq, status = response.status.as_u16(), "response ready");
        let outgoing = Outgoing {
            items: response_items(response, info.version, attr, info.head),
            close: attr == ConnectionAttr::Close,
            upgrade,
        };
        if let Err(error) = self.pipeline.complete(seq, outgoing) {
            trace!(connection = self.id, %error, "completion ignored");
        }
    }

    /// Starts a response whose body follows in parts.
    fn start_stream(&mut self, seq: u64, response: Response, chunked: bool) {
        let Some(slot) = self.pipeline.get(seq) else {
            trace!(connection = self.id, seq, "response for a finished request ignored");
            return;
        };
        if slot.status != SlotStatus::AwaitingHandler {
            trace!(connection = self.id, seq, "request already answered");
            return;
        }
        let (info, keep_alive) = (slot.info, slot.keep_alive);
        if self.upgrade_pending == Some(seq) {
            self.upgrade_pending = None;
        }

        let with_body = !info.head && !response.status.is_bodiless();
        // chunked coding needs HTTP/1.1, older peers read until close
        let chunked = chunked && (info.version.major, info.version.minor) >= (1, 1);
        let delimited = chunked || !with_body || response.header("Content-Length").is_some();
        let close = !keep_alive || response.close || !delimited;
        let framing = if chunked { Framing::Chunked } else { Framing::UserControlled };
        let attr = if close {
            self.stop_reading = true;
            ConnectionAttr::Close
        } else {
            ConnectionAttr::KeepAlive
        };

        debug!(connection = self.id, seq, status = response.status.as_u16(), chunked, "streamed response started");
        let mut items = vec![OutputItem::Buffer(serialize_head_framed(&response, info.version, attr, framing))];
        if with_body {
            items.extend(body_part_items(response.body, chunked));
        }
        self.streams.insert(seq, OpenStream { chunked, with_body, close });

        if let Err(error) = self.pipeline.append(seq, Outgoing::part(items), false) {
            trace!(connection = self.id, %error, "stream head ignored");
        }
    }

    fn stream_data(&mut self, seq: u64, data: Bytes) {
        let Some(stream) = self.streams.get(&seq).copied() else {
            trace!(connection = self.id, seq, "part of an unknown stream ignored");
            return;
        };
        if !stream.with_body {
            return;
        }

        let items = body_part_items(Body::Bytes(data), stream.chunked);
        if let Err(error) = self.pipeline.append(seq, Outgoing::part(items), false) {
            trace!(connection = self.id, %error, "stream part ignored");
        }
    }

    /// Appends the final part of a stream. A truncated stream closes the
    /// connection instead of ending the body.
    fn finish_stream(&mut self, seq: u64, truncated: bool) {
        let Some(stream) = self.streams.remove(&seq) else {
            trace!(connection = self.id, seq, "end of an unknown stream ignored");
            return;
        };

        let mut items = Vec::new();
        if stream.chunked && stream.with_body && !truncated {
            items.push(last_chunk());
        }
        if truncated {
            self.stop_reading = true;
        }

        let last = Outgoing {
            items,
            close: stream.close || truncated,
            upgrade: None,
        };
        if let Err(error) = self.pipeline.append(seq, last, true) {
            trace!(connection = self.id, %error, "stream end ignored");
        }
    }

    /// Moves response parts to the output, strictly in request order. Parts
    /// of the oldest response go out as they arrive; the next response waits
    /// for its final part.
    fn drain_pipeline(&mut self) {
        while !self.terminal_queued {
            let Some(drained) = self.pipeline.next_drainable() else {
                break;
            };

            let mut close = false;
            let mut upgrade = None;
            for part in drained.parts {
                self.output.enqueue_all(part.items);
                close |= part.close;
                upgrade = upgrade.or(part.upgrade);
            }
            if !drained.complete {
                break;
            }

            self.terminal_queued = close || upgrade.is_some();
            self.output.enqueue(OutputItem::End(ResponseEnd {
                seq: drained.seq,
                close,
                upgrade,
            }));
        }
    }

    async fn write_output(&mut self) -> anyhow::Result<Option<Exit>> {
        let (kind, limit) = match self.output.pending_kind() {
            Some(PendingKind::File) => (TimeoutKind::Sendfile, self.settings.sendfile.timelimit),
            _ => (
                TimeoutKind::WriteResponse,
                self.settings.connection.write_http_response_timelimit,
            ),
        };
        self.arm(kind, Instant::now() + limit);

        let sendfile = self.settings.sendfile.clone();
        let result = {
            let write = drive_output(&mut self.transport, &mut self.output, &sendfile);
            tokio::pin!(write);
            loop {
                tokio::select! {
                    biased;
                    result = &mut write => break result,
                    event = self.events.recv() => match event {
                        Some(ConnectionEvent::Timeout(expired)) => {
                            if let Some(kind) = self.guard.take_expired(expired) {
                                warn!(connection = self.id, ?kind, "write timed out");
                                return Ok(Some(Exit::Abort));
                            }
                        }
                        Some(event) => self.deferred.push_back(event),
                        None => return Ok(Some(Exit::Abort)),
                    },
                }
            }
        };
        self.guard.cancel();

        let written = match result {
            Ok(written) => written,
            // the file transfer watches the same deadline as the guard
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                warn!(connection = self.id, ?kind, "write timed out");
                return Ok(Some(Exit::Abort));
            }
            Err(e) => return Err(e).context("write failed"),
        };
        trace!(connection = self.id, bytes = written, "written");
        self.last_write = Instant::now();

        if let Some(exit) = self.take_finished() {
            return Ok(Some(exit));
        }
        if self.pipeline.is_empty() && !self.output.has_pending() {
            self.idle_since = Instant::now();
        }
        Ok(None)
    }

    fn take_finished(&mut self) -> Option<Exit> {
        while let Some(end) = self.output.pop_finished() {
            trace!(connection = self.id, seq = end.seq, "response written");
            if let Some(handler) = end.upgrade {
                return Some(Exit::Upgrade(handler));
            }
            if end.close {
                return Some(Exit::Close);
            }
        }
        None
    }

    fn on_event(&mut self, event: ConnectionEvent) -> Option<Exit> {
        match event {
            ConnectionEvent::Response { seq, response, upgrade } => {
                self.complete(seq, response, upgrade);
                None
            }
            ConnectionEvent::Stream { seq, part } => {
                match part {
                    StreamPart::Head { response, chunked } => self.start_stream(seq, response, chunked),
                    StreamPart::Data(data) => self.stream_data(seq, data),
                    StreamPart::Finish => self.finish_stream(seq, false),
                }
                None
            }
            ConnectionEvent::Abandoned { seq } => {
                if self.is_awaiting(seq) {
                    warn!(connection = self.id, seq, "request dropped without a response");
                    self.complete(seq, Response::internal_error(), None);
                } else if self.streams.contains_key(&seq) {
                    warn!(connection = self.id, seq, "response stream dropped before its end");
                    self.finish_stream(seq, true);
                }
                None
            }
            ConnectionEvent::Timeout(expired) => self.on_timeout(expired),
            ConnectionEvent::WsSend(_) | ConnectionEvent::WsClose { .. } => {
                trace!(connection = self.id, "websocket event before upgrade ignored");
                None
            }
        }
    }

    fn on_timeout(&mut self, expired: Expired) -> Option<Exit> {
        let Some(kind) = self.guard.take_expired(expired) else {
            trace!(connection = self.id, "stale timer ignored");
            return None;
        };

        match kind {
            TimeoutKind::ReadNextMessage => {
                debug!(connection = self.id, "no request within the read time limit");
                Some(Exit::Close)
            }
            TimeoutKind::HandleRequest => {
                match self.pipeline.front_pending().map(|slot| (slot.seq, slot.status)) {
                    Some((seq, SlotStatus::AwaitingHandler)) => {
                        warn!(connection = self.id, seq, "handler did not respond in time");
                        self.complete(seq, Response::gateway_timeout(), None);
                    }
                    Some((seq, _)) => {
                        // the head is out, the body can only be cut short
                        warn!(connection = self.id, seq, "response stream stalled");
                        self.finish_stream(seq, true);
                    }
                    None => {}
                }
                None
            }
            TimeoutKind::WriteResponse | TimeoutKind::Sendfile => {
                warn!(connection = self.id, ?kind, "write timed out");
                Some(Exit::Abort)
            }
            TimeoutKind::WsKeepalive | TimeoutKind::WsCloseHandshake => None,
        }
    }

    /// Handler timer for the oldest unfinished response, or the read timer
    /// while nothing is in flight.
    fn rearm_waiting_timer(&mut self) {
        let limits = &self.settings.connection;
        let wanted = if let Some(slot) = self.pipeline.front_awaiting() {
            Some((TimeoutKind::HandleRequest, slot.admitted_at + limits.handle_request_timeout))
        } else if let Some(slot) = self.pipeline.front_pending() {
            // a stream gets the same time between its parts
            let since = slot.last_progress.max(self.last_write);
            Some((TimeoutKind::HandleRequest, since + limits.handle_request_timeout))
        } else if self.pipeline.is_empty() && !self.read_closed {
            Some((
                TimeoutKind::ReadNextMessage,
                self.idle_since + limits.read_next_http_message_timelimit,
            ))
        } else {
            None
        };

        match wanted {
            Some(armed) if self.guard.armed() == Some(armed) => {}
            Some((kind, deadline)) => self.arm(kind, deadline),
            None => self.guard.cancel(),
        }
    }

    fn arm(&mut self, kind: TimeoutKind, deadline: Instant) {
        let notify = self.registration.timeout_notifier();
        self.guard.arm(deadline, kind, notify);
    }

    fn is_awaiting(&self, seq: u64) -> bool {
        self.pipeline
            .get(seq)
            .is_some_and(|slot| slot.status == SlotStatus::AwaitingHandler)
    }

    fn accepting_requests(&self) -> bool {
        !self.stop_reading
            && !self.terminal_queued
            && self.upgrade_pending.is_none()
            && !self.pipeline.is_full()
    }

    fn can_read(&self) -> bool {
        !self.read_closed && self.accepting_requests()
    }
}

/// Runs one connection over `transport` to completion.
pub async fn serve_connection<T: Transport>(transport: T, settings: Arc<ConnectionSettings>) -> anyhow::Result<()> {
    Connection::new(transport, settings).run().await
}
