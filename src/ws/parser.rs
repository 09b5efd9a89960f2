//! Incremental frame decoder.
//!
//! Bytes are fed as they arrive; a frame may be split across any number of
//! reads. The parser stops consuming at the end of the current frame, so
//! the caller takes the frame, and feeds the rest again.

use bytes::BytesMut;
use thiserror::Error;

use crate::ws::frame::{Frame, FrameHeader, apply_mask};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("payload of {len} bytes exceeds the limit of {max}")]
    TooBig { len: u64, max: u64 },
    #[error("64-bit payload length has its most significant bit set")]
    InvalidLength,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Flags,
    ExtendedLength,
    MaskKey,
    Payload,
    Done,
}

#[derive(Debug)]
pub struct FrameParser {
    max_payload: u64,
    stage: Stage,
    /// Header bytes still needed to finish the current stage.
    expected: usize,
    scratch: Vec<u8>,
    header: FrameHeader,
    remaining: u64,
    payload: BytesMut,
}

impl FrameParser {
    pub fn new(max_payload: u64) -> Self {
        Self {
            max_payload,
            stage: Stage::Flags,
            expected: 2,
            scratch: Vec::with_capacity(8),
            header: FrameHeader::default(),
            remaining: 0,
            payload: BytesMut::new(),
        }
    }

    /// Consumes bytes of the current frame and returns how many were used.
    /// Never reads past the end of the frame.
    pub fn feed(&mut self, data: &[u8]) -> Result<usize, FrameError> {
        let mut consumed = 0;

        while consumed < data.len() && self.stage != Stage::Done {
            let available = &data[consumed..];

            if self.stage == Stage::Payload {
                let take = usize::try_from(self.remaining)
                    .unwrap_or(usize::MAX)
                    .min(available.len());
                let start = self.payload.len();
                self.payload.extend_from_slice(&available[..take]);
                if let Some(key) = self.header.mask_key {
                    apply_mask(&mut self.payload[start..], key, start);
                }

                consumed += take;
                self.remaining -= take as u64;
                if self.remaining == 0 {
                    self.stage = Stage::Done;
                }
                continue;
            }

            let take = (self.expected - self.scratch.len()).min(available.len());
            self.scratch.extend_from_slice(&available[..take]);
            consumed += take;

            if self.scratch.len() == self.expected {
                self.finish_stage()?;
            }
        }

        Ok(consumed)
    }

    fn finish_stage(&mut self) -> Result<(), FrameError> {
        match self.stage {
            Stage::Flags => {
                let (b0, b1) = (self.scratch[0], self.scratch[1]);
                self.header.fin = b0 & 0x80 != 0;
                self.header.rsv1 = b0 & 0x40 != 0;
                self.header.rsv2 = b0 & 0x20 != 0;
                self.header.rsv3 = b0 & 0x10 != 0;
                self.header.opcode = b0 & 0x0F;
                self.header.masked = b1 & 0x80 != 0;

                match b1 & 0x7F {
                    126 => self.next_stage(Stage::ExtendedLength, 2),
                    127 => self.next_stage(Stage::ExtendedLength, 8),
                    len => self.set_length(u64::from(len))?,
                }
            }
            Stage::ExtendedLength => {
                let len = self
                    .scratch
                    .iter()
                    .fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
                if self.scratch.len() == 8 && self.scratch[0] & 0x80 != 0 {
                    return Err(FrameError::InvalidLength);
                }
                self.set_length(len)?;
            }
            Stage::MaskKey => {
                let key = [self.scratch[0], self.scratch[1], self.scratch[2], self.scratch[3]];
                self.header.mask_key = Some(key);
                self.begin_payload();
            }
            Stage::Payload | Stage::Done => {}
        }
        Ok(())
    }

    fn set_length(&mut self, len: u64) -> Result<(), FrameError> {
        if len > self.max_payload {
            return Err(FrameError::TooBig {
                len,
                max: self.max_payload,
            });
        }
        self.header.payload_len = len;

        if self.header.masked {
            self.next_stage(Stage::MaskKey, 4);
        } else {
            self.begin_payload();
        }
        Ok(())
    }

    fn begin_payload(&mut self) {
        self.scratch.clear();
        self.remaining = self.header.payload_len;
        self.payload
            .reserve(usize::try_from(self.remaining).unwrap_or(0).min(64 * 1024));
        self.stage = if self.remaining == 0 { Stage::Done } else { Stage::Payload };
    }

    fn next_stage(&mut self, stage: Stage, expected: usize) {
        self.scratch.clear();
        self.stage = stage;
        self.expected = expected;
    }

    /// The header, once all of it has been read.
    pub fn header(&self) -> Option<&FrameHeader> {
        match self.stage {
            Stage::Payload | Stage::Done => Some(&self.header),
            _ => None,
        }
    }

    /// Unmasked payload bytes received so far.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn is_complete(&self) -> bool {
        self.stage == Stage::Done
    }

    /// Hands out the completed frame and gets ready for the next one.
    pub fn take_frame(&mut self) -> Option<Frame> {
        if !self.is_complete() {
            return None;
        }
        let frame = Frame {
            header: self.header,
            payload: self.payload.split().freeze(),
        };
        self.reset();
        Some(frame)
    }

    pub fn reset(&mut self) {
        self.stage = Stage::Flags;
        self.expected = 2;
        self.scratch.clear();
        self.header = FrameHeader::default();
        self.remaining = 0;
        self.payload.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_at_frame_boundary() {
        let mut parser = FrameParser::new(1024);
        let data = [0x89, 0x00, 0x81, 0x01, b'x'];

        assert_eq!(parser.feed(&data).unwrap(), 2);
        let ping = parser.take_frame().unwrap();
        assert_eq!(ping.header.opcode, 0x9);
        assert!(ping.payload.is_empty());

        assert_eq!(parser.feed(&data[2..]).unwrap(), 3);
        assert_eq!(&parser.take_frame().unwrap().payload[..], b"x");
    }

    #[test]
    fn oversized_payload_is_rejected_early() {
        let mut parser = FrameParser::new(100);
        let err = parser.feed(&[0x82, 126, 0x01, 0x00]).unwrap_err();
        assert_eq!(err, FrameError::TooBig { len: 256, max: 100 });
    }
}
