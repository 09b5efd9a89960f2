//! Byte-at-a-time UTF-8 validation.
//!
//! Follows the WHATWG decoder: the permitted range of the next continuation
//! byte narrows after `E0`, `ED`, `F0` and `F4`, which rejects overlong
//! forms, surrogates and code points above U+10FFFF as early as possible.

#[derive(Debug, Clone)]
pub struct Utf8Checker {
    needed: u8,
    seen: u8,
    lower: u8,
    upper: u8,
    failed: bool,
}

impl Default for Utf8Checker {
    fn default() -> Self {
        Self {
            needed: 0,
            seen: 0,
            lower: 0x80,
            upper: 0xBF,
            failed: false,
        }
    }
}

impl Utf8Checker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` once the input can no longer be valid UTF-8.
    pub fn process_byte(&mut self, byte: u8) -> bool {
        if self.failed {
            return false;
        }

        if self.needed == 0 {
            match byte {
                0x00..=0x7F => {}
                0xC2..=0xDF => self.needed = 1,
                0xE0..=0xEF => {
                    if byte == 0xE0 {
                        self.lower = 0xA0;
                    } else if byte == 0xED {
                        self.upper = 0x9F;
                    }
                    self.needed = 2;
                }
                0xF0..=0xF4 => {
                    if byte == 0xF0 {
                        self.lower = 0x90;
                    } else if byte == 0xF4 {
                        self.upper = 0x8F;
                    }
                    self.needed = 3;
                }
                _ => self.failed = true,
            }
            return !self.failed;
        }

        if byte < self.lower || byte > self.upper {
            self.failed = true;
            return false;
        }

        self.lower = 0x80;
        self.upper = 0xBF;
        self.seen += 1;
        if self.seen == self.needed {
            self.needed = 0;
            self.seen = 0;
        }
        true
    }

    pub fn process(&mut self, bytes: &[u8]) -> bool {
        bytes.iter().all(|&b| self.process_byte(b))
    }

    /// Valid so far and not inside a multi-byte sequence.
    pub fn is_complete(&self) -> bool {
        !self.failed && self.needed == 0
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
