//! RFC 6455 protocol rules for incoming frames.
//!
//! The validator sees each frame as a header ([`ProtocolValidator::process_new_frame`]),
//! any number of payload pieces ([`ProtocolValidator::process_next_payload_part`])
//! and an end ([`ProtocolValidator::finish_frame`]). Header rules, the
//! fragmentation order, UTF-8 of text messages and the close payload are
//! all checked here; every failure maps to the close status sent to the peer.

use thiserror::Error;

use crate::ws::frame::{FrameHeader, MAX_CONTROL_PAYLOAD, Opcode};
use crate::ws::message::CloseCode;
use crate::ws::parser::FrameError;
use crate::ws::utf8::Utf8Checker;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("reserved bits set without a negotiated extension")]
    ReservedBits,
    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),
    #[error("client frame is not masked")]
    UnmaskedFrame,
    #[error("control frame is fragmented")]
    FragmentedControl,
    #[error("control frame payload of {0} bytes")]
    ControlTooLarge(u64),
    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,
    #[error("new data frame while a fragmented message is unfinished")]
    ExpectedContinuation,
    #[error("text payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("close payload of one byte")]
    InvalidClosePayload,
    #[error("close status {0} is not allowed on the wire")]
    InvalidCloseCode(u16),
    #[error("close reason is not valid UTF-8")]
    InvalidCloseReason,
    #[error("payload exceeds the configured limit")]
    MessageTooBig,
    #[error("malformed frame length")]
    InvalidLength,
    #[error("previous frame is not finished")]
    FrameInProgress,
    #[error("no frame in progress")]
    NoFrameInProgress,
}

impl ValidationError {
    /// Status of the close frame sent for this failure.
    pub fn close_code(&self) -> CloseCode {
        match self {
            ValidationError::InvalidUtf8 | ValidationError::InvalidCloseReason => CloseCode::INVALID_DATA,
            ValidationError::MessageTooBig => CloseCode::TOO_BIG,
            ValidationError::FrameInProgress | ValidationError::NoFrameInProgress => CloseCode::INTERNAL_ERROR,
            _ => CloseCode::PROTOCOL_ERROR,
        }
    }
}

impl From<FrameError> for ValidationError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::TooBig { .. } => ValidationError::MessageTooBig,
            FrameError::InvalidLength => ValidationError::InvalidLength,
        }
    }
}

/// Data type of a fragmented message that is still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataKind {
    Text,
    Binary,
}

#[derive(Debug, Clone, Copy)]
struct FrameState {
    opcode: Opcode,
    fin: bool,
    text: bool,
}

#[derive(Debug, Default)]
pub struct ProtocolValidator {
    current: Option<FrameState>,
    continued: Option<DataKind>,
    text: Utf8Checker,
    close_reason: Utf8Checker,
    close_code: [u8; 2],
    close_code_len: u8,
}

impl ProtocolValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks the header rules and advances the fragmentation state.
    pub fn process_new_frame(&mut self, header: &FrameHeader) -> Result<(), ValidationError> {
        if self.current.is_some() {
            return Err(ValidationError::FrameInProgress);
        }
        if header.has_reserved_bits() {
            return Err(ValidationError::ReservedBits);
        }
        let opcode = header.kind().ok_or(ValidationError::UnknownOpcode(header.opcode))?;
        if !header.masked {
            return Err(ValidationError::UnmaskedFrame);
        }

        let mut text = false;
        if opcode.is_control() {
            if !header.fin {
                return Err(ValidationError::FragmentedControl);
            }
            if header.payload_len > MAX_CONTROL_PAYLOAD {
                return Err(ValidationError::ControlTooLarge(header.payload_len));
            }
            if opcode == Opcode::Close {
                if header.payload_len == 1 {
                    return Err(ValidationError::InvalidClosePayload);
                }
                self.close_reason.reset();
                self.close_code_len = 0;
            }
        } else {
            match opcode {
                Opcode::Continuation => {
                    let kind = self.continued.ok_or(ValidationError::UnexpectedContinuation)?;
                    text = kind == DataKind::Text;
                    if header.fin {
                        self.continued = None;
                    }
                }
                _ => {
                    if self.continued.is_some() {
                        return Err(ValidationError::ExpectedContinuation);
                    }
                    let kind = if opcode == Opcode::Text { DataKind::Text } else { DataKind::Binary };
                    text = kind == DataKind::Text;
                    if text {
                        self.text.reset();
                    }
                    if !header.fin {
                        self.continued = Some(kind);
                    }
                }
            }
        }

        self.current = Some(FrameState {
            opcode,
            fin: header.fin,
            text,
        });
        Ok(())
    }

    /// Feeds unmasked payload bytes of the current frame.
    pub fn process_next_payload_part(&mut self, part: &[u8]) -> Result<(), ValidationError> {
        let frame = self.current.ok_or(ValidationError::NoFrameInProgress)?;

        if frame.text && !self.text.process(part) {
            return Err(ValidationError::InvalidUtf8);
        }

        if frame.opcode == Opcode::Close {
            for &byte in part {
                if self.close_code_len < 2 {
                    self.close_code[usize::from(self.close_code_len)] = byte;
                    self.close_code_len += 1;
                    if self.close_code_len == 2 {
                        let code = u16::from_be_bytes(self.close_code);
                        if !CloseCode(code).is_allowed_on_wire() {
                            return Err(ValidationError::InvalidCloseCode(code));
                        }
                    }
                } else if !self.close_reason.process_byte(byte) {
                    return Err(ValidationError::InvalidCloseReason);
                }
            }
        }

        Ok(())
    }

    /// Ends the current frame. A text message must not stop in the middle
    /// of a code point; pieces of a fragmented message may.
    pub fn finish_frame(&mut self) -> Result<(), ValidationError> {
        let frame = self.current.take().ok_or(ValidationError::NoFrameInProgress)?;

        if frame.text && frame.fin && !self.text.is_complete() {
            return Err(ValidationError::InvalidUtf8);
        }

        if frame.opcode == Opcode::Close {
            if self.close_code_len == 1 {
                return Err(ValidationError::InvalidClosePayload);
            }
            if !self.close_reason.is_complete() {
                return Err(ValidationError::InvalidCloseReason);
            }
        }

        Ok(())
    }

    /// Forgets everything, including an open fragmented message.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// A fragmented message has been started and not yet finished.
    pub fn in_fragmented_message(&self) -> bool {
        self.continued.is_some()
    }
}
