//! Outgoing data of one connection.
//!
//! Fragments are queued in order; [`OutputCoordinator::flush`] exposes the
//! leading run of buffers as one vectored batch and
//! [`OutputCoordinator::start_sendfile`] turns a leading file body into a
//! [`SendfileOperation`]. At most one of the two is in flight at a time.
//! [`ResponseEnd`] markers travel with the data and surface once every byte
//! queued before them has been transmitted.

use std::collections::VecDeque;
use std::io::{self, IoSlice};

use bytes::{Buf, Bytes};
use tokio::io::AsyncWriteExt;

use crate::config::SendfileConfig;
use crate::http::sendfile::{FileBody, SendfileOperation};
use crate::transport::Transport;
use crate::ws::message::WsHandler;

/// Most fragments handed to a single vectored write.
pub const MAX_BATCH: usize = 64;

/// Marks the last fragment of a response.
pub struct ResponseEnd {
    pub seq: u64,
    pub close: bool,
    pub upgrade: Option<Box<dyn WsHandler>>,
}

impl std::fmt::Debug for ResponseEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseEnd")
            .field("seq", &self.seq)
            .field("close", &self.close)
            .field("upgrade", &self.upgrade.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub enum OutputItem {
    Buffer(Bytes),
    File(FileBody),
    End(ResponseEnd),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Buffers,
    File,
}

#[derive(Debug)]
pub struct OutputCoordinator {
    pending: VecDeque<OutputItem>,
    finished: VecDeque<ResponseEnd>,
    max_batch: usize,
    transmitting: bool,
    sendfile: Option<SendfileOperation>,
}

impl Default for OutputCoordinator {
    fn default() -> Self {
        Self::new(MAX_BATCH)
    }
}

impl OutputCoordinator {
    pub fn new(max_batch: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            finished: VecDeque::new(),
            max_batch: max_batch.max(1),
            transmitting: false,
            sendfile: None,
        }
    }

    pub fn enqueue(&mut self, item: OutputItem) {
        match item {
            OutputItem::Buffer(ref bytes) if bytes.is_empty() => {}
            OutputItem::File(ref file) if file.is_empty() => {}
            item => self.pending.push_back(item),
        }
        self.collect_finished();
    }

    pub fn enqueue_all(&mut self, items: impl IntoIterator<Item = OutputItem>) {
        for item in items {
            self.enqueue(item);
        }
    }

    /// Next vectored batch: the leading buffers up to the first file body,
    /// at most `max_batch` of them. Empty when nothing is writable.
    pub fn flush(&mut self) -> Vec<IoSlice<'_>> {
        self.collect_finished();

        let slices: Vec<IoSlice<'_>> = self
            .pending
            .iter()
            .take_while(|item| !matches!(item, OutputItem::File(_)))
            .filter_map(|item| match item {
                OutputItem::Buffer(bytes) => Some(IoSlice::new(bytes)),
                _ => None,
            })
            .take(self.max_batch)
            .collect();

        self.transmitting = !slices.is_empty();
        slices
    }

    /// Releases `n` transmitted bytes of the current batch.
    pub fn mark_complete(&mut self, mut n: usize) {
        self.transmitting = false;

        while let Some(front) = self.pending.front_mut() {
            match front {
                OutputItem::End(_) => {
                    if let Some(OutputItem::End(end)) = self.pending.pop_front() {
                        self.finished.push_back(end);
                    }
                }
                OutputItem::Buffer(bytes) => {
                    if n == 0 {
                        break;
                    }
                    if n >= bytes.len() {
                        n -= bytes.len();
                        self.pending.pop_front();
                    } else {
                        bytes.advance(n);
                        break;
                    }
                }
                OutputItem::File(_) => break,
            }
        }
    }

    /// Starts transmitting the leading file body, if the front is one.
    pub fn start_sendfile(&mut self, config: &SendfileConfig) -> Option<&mut SendfileOperation> {
        self.collect_finished();
        if self.transmitting {
            return None;
        }

        let op = match self.pending.front() {
            Some(OutputItem::File(body)) => SendfileOperation::new(body, config),
            _ => return None,
        };
        self.transmitting = true;
        self.sendfile = Some(op);
        self.sendfile.as_mut()
    }

    /// Ends the in-flight file transfer and drops its body from the queue.
    pub fn finish_sendfile(&mut self) -> Option<SendfileOperation> {
        let op = self.sendfile.take()?;
        self.transmitting = false;
        if matches!(self.pending.front(), Some(OutputItem::File(_))) {
            self.pending.pop_front();
        }
        self.collect_finished();
        Some(op)
    }

    /// Next response whose bytes have all left.
    pub fn pop_finished(&mut self) -> Option<ResponseEnd> {
        self.finished.pop_front()
    }

    /// What the next transmission will be.
    pub fn pending_kind(&self) -> Option<PendingKind> {
        self.pending.iter().find_map(|item| match item {
            OutputItem::Buffer(_) => Some(PendingKind::Buffers),
            OutputItem::File(_) => Some(PendingKind::File),
            OutputItem::End(_) => None,
        })
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn is_transmitting(&self) -> bool {
        self.transmitting
    }

    /// Nothing queued, nothing in flight, nothing left to report.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.finished.is_empty() && !self.transmitting
    }

    /// Drops everything queued.
    pub fn fail(&mut self) {
        self.pending.clear();
        self.finished.clear();
        self.sendfile = None;
        self.transmitting = false;
    }

    fn collect_finished(&mut self) {
        while matches!(self.pending.front(), Some(OutputItem::End(_))) {
            if let Some(OutputItem::End(end)) = self.pending.pop_front() {
                self.finished.push_back(end);
            }
        }
    }
}

/// Performs the next transmission: either the leading file body, or
/// vectored writes until a file body or the end of the queue is reached.
/// Returns the number of bytes sent.
pub async fn drive_output<T: Transport>(
    transport: &mut T,
    output: &mut OutputCoordinator,
    sendfile: &SendfileConfig,
) -> io::Result<u64> {
    if output.pending_kind() == Some(PendingKind::File) {
        let result = match output.start_sendfile(sendfile) {
            Some(op) => transport.transmit_file(op).await,
            None => Ok(0),
        };
        if result.is_ok() {
            output.finish_sendfile();
        }
        return result;
    }

    let mut written = 0u64;
    loop {
        let n = {
            let slices = output.flush();
            if slices.is_empty() {
                break;
            }
            transport.write_vectored(&slices).await?
        };
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        output.mark_complete(n);
        written += n as u64;
    }
    transport.flush().await?;
    Ok(written)
}
