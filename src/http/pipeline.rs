//! Ordered in-flight requests of one connection.
//!
//! Handlers may finish in any order; [`PipelineQueue::next_drainable`] only
//! ever hands out parts of the oldest slot. A slot collects response parts
//! until the final one arrives and leaves the queue with it.

use std::collections::VecDeque;

use thiserror::Error;
use tokio::time::Instant;

use crate::http::request::Version;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PipelineError {
    #[error("no in-flight request with sequence number {0}")]
    UnknownSlot(u64),
    #[error("request {0} already has a response")]
    AlreadyComplete(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    AwaitingHandler,
    /// Some parts of a streamed response are in, more will follow.
    Responding,
    HandlerComplete,
}

/// What the response of a slot needs to know about its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestInfo {
    pub version: Version,
    pub head: bool,
    pub upgrade: bool,
}

#[derive(Debug)]
pub struct Slot<T> {
    pub seq: u64,
    pub status: SlotStatus,
    pub keep_alive: bool,
    pub info: RequestInfo,
    pub admitted_at: Instant,
    /// Admission, or the arrival of the latest response part.
    pub last_progress: Instant,
    parts: VecDeque<T>,
}

impl<T> Slot<T> {
    /// Whether the final response part has arrived.
    pub fn response_complete(&self) -> bool {
        self.status == SlotStatus::HandlerComplete
    }

    /// Parts received but not drained yet.
    pub fn ready_parts(&self) -> usize {
        self.parts.len()
    }
}

/// Response parts of the oldest slot released for writing.
#[derive(Debug)]
pub struct Drained<T> {
    pub seq: u64,
    pub keep_alive: bool,
    pub parts: Vec<T>,
    /// The slot got its final part and has left the queue.
    pub complete: bool,
}

#[derive(Debug)]
pub struct PipelineQueue<T> {
    slots: VecDeque<Slot<T>>,
    next_seq: u64,
    max_depth: usize,
}

impl<T> PipelineQueue<T> {
    pub fn new(max_depth: usize) -> Self {
        Self {
            slots: VecDeque::new(),
            next_seq: 0,
            max_depth: max_depth.max(1),
        }
    }

    /// Admits a new request. Refused (`None`) once the depth bound is reached.
    pub fn push(&mut self, keep_alive: bool, info: RequestInfo) -> Option<u64> {
        if self.is_full() {
            return None;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let now = Instant::now();
        self.slots.push_back(Slot {
            seq,
            status: SlotStatus::AwaitingHandler,
            keep_alive,
            info,
            admitted_at: now,
            last_progress: now,
            parts: VecDeque::new(),
        });
        Some(seq)
    }

    /// Stores the whole response of slot `seq`.
    pub fn complete(&mut self, seq: u64, response: T) -> Result<(), PipelineError> {
        self.append(seq, response, true)
    }

    /// Adds a response part to slot `seq`; `response_complete` marks the
    /// final one.
    pub fn append(&mut self, seq: u64, part: T, response_complete: bool) -> Result<(), PipelineError> {
        let slot = self.get_mut(seq).ok_or(PipelineError::UnknownSlot(seq))?;
        if slot.status == SlotStatus::HandlerComplete {
            return Err(PipelineError::AlreadyComplete(seq));
        }

        slot.status = if response_complete {
            SlotStatus::HandlerComplete
        } else {
            SlotStatus::Responding
        };
        slot.last_progress = Instant::now();
        slot.parts.push_back(part);
        Ok(())
    }

    /// Takes the ready parts of the oldest slot. Later slots are never
    /// touched, whatever their state. The oldest slot is removed together
    /// with its final part.
    pub fn next_drainable(&mut self) -> Option<Drained<T>> {
        let front = self.slots.front_mut()?;
        if front.parts.is_empty() {
            return None;
        }

        let parts: Vec<T> = front.parts.drain(..).collect();
        let (seq, keep_alive) = (front.seq, front.keep_alive);
        let complete = front.status == SlotStatus::HandlerComplete;
        if complete {
            self.slots.pop_front();
        }
        Some(Drained {
            seq,
            keep_alive,
            parts,
            complete,
        })
    }

    /// The oldest slot, if it still waits for its handler.
    pub fn front_awaiting(&self) -> Option<&Slot<T>> {
        self.slots
            .front()
            .filter(|slot| slot.status == SlotStatus::AwaitingHandler)
    }

    /// The oldest slot, if its response is not complete yet.
    pub fn front_pending(&self) -> Option<&Slot<T>> {
        self.slots.front().filter(|slot| !slot.response_complete())
    }

    pub fn get(&self, seq: u64) -> Option<&Slot<T>> {
        let front = self.slots.front()?.seq;
        let index = usize::try_from(seq.checked_sub(front)?).ok()?;
        self.slots.get(index)
    }

    fn get_mut(&mut self, seq: u64) -> Option<&mut Slot<T>> {
        let front = self.slots.front()?.seq;
        let index = usize::try_from(seq.checked_sub(front)?).ok()?;
        self.slots.get_mut(index)
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.max_depth
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }
}
