use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Context as _;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::registry::{ConnectionEvent, Registration};
use crate::settings::ConnectionSettings;
use crate::timer::{TimeoutGuard, TimeoutKind};
use crate::transport::Transport;
use crate::ws::frame::{Frame, MAX_CONTROL_PAYLOAD, Opcode, encode_frame};
use crate::ws::message::{CloseCode, Message, WsHandle, WsHandler};
use crate::ws::parser::FrameParser;
use crate::ws::validator::{ProtocolValidator, ValidationError};

/// What an HTTP connection leaves behind when it switches protocols.
pub struct Upgraded<T> {
    pub id: u64,
    pub registration: Registration,
    pub transport: T,
    pub settings: Arc<ConnectionSettings>,
    /// Bytes that arrived after the upgrade request.
    pub input: BytesMut,
    pub events: UnboundedReceiver<ConnectionEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    AnyFrame,
    /// Our close frame is out; only the peer's close matters now.
    CloseFrameOnly,
    Nothing,
}

/// An upgraded connection speaking RFC 6455.
pub struct WsConnection<T: Transport> {
    id: u64,
    registration: Registration,
    transport: T,
    settings: Arc<ConnectionSettings>,
    input: BytesMut,
    events: UnboundedReceiver<ConnectionEvent>,
    deferred: VecDeque<ConnectionEvent>,
    guard: TimeoutGuard,
    parser: FrameParser,
    validator: ProtocolValidator,
    header_checked: bool,
    validated: usize,
    handler: Box<dyn WsHandler>,
    handle: WsHandle,
    read_state: ReadState,
    close_sent: bool,
    close_deadline: Option<Instant>,
    close_notified: bool,
    last_received: Instant,
    last_ping: Instant,
}

impl<T: Transport> WsConnection<T> {
    pub fn new(upgraded: Upgraded<T>, handler: Box<dyn WsHandler>) -> Self {
        let Upgraded {
            id,
            registration,
            transport,
            settings,
            input,
            events,
        } = upgraded;

        let handle = WsHandle::new(Arc::clone(registration.registry()), registration.handle(), id);
        let now = Instant::now();

        Self {
            id,
            transport,
            input,
            events,
            deferred: VecDeque::new(),
            guard: TimeoutGuard::new(),
            parser: FrameParser::new(settings.websocket.max_payload_size),
            validator: ProtocolValidator::new(),
            header_checked: false,
            validated: 0,
            handler,
            handle,
            read_state: ReadState::AnyFrame,
            close_sent: false,
            close_deadline: None,
            close_notified: false,
            last_received: now,
            last_ping: now,
            registration,
            settings,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        info!(connection = self.id, "websocket opened");
        self.handler.on_open(&self.handle);

        let result = self.serve().await;
        self.guard.cancel();
        self.notify_close(CloseCode::ABNORMAL, "");

        let limit = self.settings.connection.write_http_response_timelimit;
        let _ = tokio::time::timeout(limit, self.transport.shutdown()).await;
        debug!(connection = self.id, "websocket closed");
        result
    }

    async fn serve(&mut self) -> anyhow::Result<()> {
        loop {
            while let Some(event) = self.deferred.pop_front() {
                self.on_event(event).await?;
            }
            if self.read_state == ReadState::Nothing {
                return Ok(());
            }

            match self.read_frame() {
                Ok(Some(frame)) => {
                    self.last_received = Instant::now();
                    self.on_frame(frame).await?;
                    continue;
                }
                Ok(None) => {}
                Err(error) => {
                    self.fail(error).await?;
                    continue;
                }
            }

            self.rearm_timer();
            self.input.reserve(self.settings.connection.buffer_size);

            tokio::select! {
                biased;
                event = self.events.recv() => match event {
                    Some(event) => self.on_event(event).await?,
                    None => return Ok(()),
                },
                read = self.transport.read_buf(&mut self.input) => {
                    let n = read.context("websocket read failed")?;
                    if n == 0 {
                        debug!(connection = self.id, "peer went away without a close frame");
                        return Ok(());
                    }
                    trace!(connection = self.id, bytes = n, "read");
                }
            }
        }
    }

    /// Decodes buffered input, validating while the payload streams in.
    /// `None` means more input is needed.
    fn read_frame(&mut self) -> Result<Option<Frame>, ValidationError> {
        while !self.input.is_empty() {
            let consumed = self.parser.feed(&self.input)?;

            if let Some(header) = self.parser.header().copied() {
                if !self.header_checked {
                    self.validator.process_new_frame(&header)?;
                    self.header_checked = true;
                }
                let payload = self.parser.payload();
                if payload.len() > self.validated {
                    self.validator.process_next_payload_part(&payload[self.validated..])?;
                    self.validated = payload.len();
                }
            }
            self.input.advance(consumed);

            if self.parser.is_complete() {
                self.validator.finish_frame()?;
                self.header_checked = false;
                self.validated = 0;
                return Ok(self.parser.take_frame());
            }
        }
        Ok(None)
    }

    async fn on_frame(&mut self, frame: Frame) -> anyhow::Result<()> {
        let Some(opcode) = frame.header.kind() else {
            return Ok(());
        };
        if self.read_state == ReadState::CloseFrameOnly && opcode != Opcode::Close {
            trace!(connection = self.id, ?opcode, "frame after close ignored");
            return Ok(());
        }

        match opcode {
            Opcode::Close => {
                let (code, reason) = parse_close_payload(&frame.payload);
                debug!(connection = self.id, %code, "close frame received");
                if !self.close_sent {
                    let echo = if frame.payload.len() >= 2 { &frame.payload[..2] } else { &[][..] };
                    self.send_frame(Opcode::Close, true, echo).await?;
                    self.close_sent = true;
                }
                self.read_state = ReadState::Nothing;
                self.notify_close(code, &reason);
            }
            Opcode::Ping => {
                self.send_frame(Opcode::Pong, true, &frame.payload).await?;
                self.deliver(frame.header.fin, opcode, frame.payload);
            }
            _ => self.deliver(frame.header.fin, opcode, frame.payload),
        }
        Ok(())
    }

    fn deliver(&mut self, fin: bool, opcode: Opcode, payload: Bytes) {
        let message = Message { fin, opcode, payload };
        self.handler.on_message(&self.handle, message);
    }

    /// Answers a protocol violation with the mapped close status and stops.
    async fn fail(&mut self, error: ValidationError) -> anyhow::Result<()> {
        let code = error.close_code();
        warn!(connection = self.id, %error, %code, "websocket protocol violation");

        if !self.close_sent {
            self.send_frame(Opcode::Close, true, &close_payload(code, "")).await?;
            self.close_sent = true;
        }
        self.read_state = ReadState::Nothing;
        self.notify_close(code, &error.to_string());
        Ok(())
    }

    async fn on_event(&mut self, event: ConnectionEvent) -> anyhow::Result<()> {
        match event {
            ConnectionEvent::WsSend(message) => {
                if self.close_sent {
                    trace!(connection = self.id, "send after close ignored");
                    return Ok(());
                }
                self.send_frame(message.opcode, message.fin, &message.payload).await
            }
            ConnectionEvent::WsClose { code, reason } => self.start_close(code, &reason).await,
            ConnectionEvent::Timeout(expired) => match self.guard.take_expired(expired) {
                Some(kind) => self.on_timeout(kind).await,
                None => Ok(()),
            },
            ConnectionEvent::Response { seq, .. }
            | ConnectionEvent::Stream { seq, .. }
            | ConnectionEvent::Abandoned { seq } => {
                trace!(connection = self.id, seq, "http completion after upgrade ignored");
                Ok(())
            }
        }
    }

    async fn on_timeout(&mut self, kind: TimeoutKind) -> anyhow::Result<()> {
        match kind {
            TimeoutKind::WsKeepalive => {
                let now = Instant::now();
                if now >= self.last_received + self.settings.websocket.idle_timeout {
                    info!(connection = self.id, "websocket idle, closing");
                    self.start_close(CloseCode::GOING_AWAY, "idle timeout").await
                } else {
                    self.last_ping = now;
                    self.send_frame(Opcode::Ping, true, &[]).await
                }
            }
            TimeoutKind::WsCloseHandshake => {
                debug!(connection = self.id, "peer did not answer the close frame");
                self.read_state = ReadState::Nothing;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn start_close(&mut self, code: CloseCode, reason: &str) -> anyhow::Result<()> {
        if self.close_sent {
            return Ok(());
        }
        self.send_frame(Opcode::Close, true, &close_payload(code, reason)).await?;
        self.close_sent = true;
        self.read_state = ReadState::CloseFrameOnly;
        self.close_deadline = Some(Instant::now() + self.settings.connection.read_next_http_message_timelimit);
        Ok(())
    }

    /// Writes one frame under the write time limit.
    async fn send_frame(&mut self, opcode: Opcode, fin: bool, payload: &[u8]) -> anyhow::Result<()> {
        let frame = encode_frame(fin, opcode, payload);
        let deadline = Instant::now() + self.settings.connection.write_http_response_timelimit;
        self.arm(TimeoutKind::WriteResponse, deadline);

        let result = {
            let transport = &mut self.transport;
            let write = async move {
                transport.write_all(&frame).await?;
                transport.flush().await
            };
            tokio::pin!(write);
            loop {
                tokio::select! {
                    biased;
                    result = &mut write => break result,
                    event = self.events.recv() => match event {
                        Some(ConnectionEvent::Timeout(expired)) => {
                            if self.guard.take_expired(expired).is_some() {
                                anyhow::bail!("websocket write timed out");
                            }
                        }
                        Some(event) => self.deferred.push_back(event),
                        None => anyhow::bail!("connection released during write"),
                    },
                }
            }
        };
        self.guard.cancel();

        result.context("websocket write failed")?;
        trace!(connection = self.id, ?opcode, len = payload.len(), "frame sent");
        Ok(())
    }

    /// Keepalive while open, the close handshake limit after our close frame.
    fn rearm_timer(&mut self) {
        let wanted = match self.close_deadline {
            Some(deadline) => (TimeoutKind::WsCloseHandshake, deadline),
            None => {
                let ws = &self.settings.websocket;
                let ping_at = self.last_received.max(self.last_ping) + ws.ping_interval;
                let idle_at = self.last_received + ws.idle_timeout;
                (TimeoutKind::WsKeepalive, ping_at.min(idle_at))
            }
        };

        if self.guard.armed() != Some(wanted) {
            self.arm(wanted.0, wanted.1);
        }
    }

    fn arm(&mut self, kind: TimeoutKind, deadline: Instant) {
        let notify = self.registration.timeout_notifier();
        self.guard.arm(deadline, kind, notify);
    }

    fn notify_close(&mut self, code: CloseCode, reason: &str) {
        if self.close_notified {
            return;
        }
        self.close_notified = true;
        self.handler.on_close(code, reason);
    }
}

/// Status and reason of a received close frame. The payload has already
/// been validated.
fn parse_close_payload(payload: &[u8]) -> (CloseCode, String) {
    if payload.len() < 2 {
        return (CloseCode::NO_STATUS, String::new());
    }
    let code = CloseCode(u16::from_be_bytes([payload[0], payload[1]]));
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    (code, reason)
}

/// Close payload, reason cut to fit a control frame on a char boundary.
fn close_payload(code: CloseCode, reason: &str) -> Bytes {
    let max_reason = MAX_CONTROL_PAYLOAD as usize - 2;
    let mut end = reason.len().min(max_reason);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }

    let mut payload = BytesMut::with_capacity(2 + end);
    payload.put_u16(code.0);
    payload.put_slice(&reason.as_bytes()[..end]);
    payload.freeze()
}
