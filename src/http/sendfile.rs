//! Chunked file transmission.
//!
//! A [`SendfileOperation`] is the resumable state of one file transfer
//! (offset, remaining length, chunk size, deadline). [`SendfileOperation::resume`]
//! pushes chunks into a [`SendfileSink`] until the file is done or the sink
//! would block; the caller waits for write readiness and resumes.

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::config::{SendfileConfig, clamp_chunk_size};

/// A region of an open file used as a response body.
#[derive(Debug, Clone)]
pub struct FileBody {
    file: Arc<File>,
    offset: u64,
    len: u64,
    chunk_size: Option<u64>,
}

impl FileBody {
    /// Opens `path` and covers the whole file.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path)?;
        Self::from_file(file)
    }

    pub fn from_file(file: File) -> io::Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            offset: 0,
            len,
            chunk_size: None,
        })
    }

    /// Restricts the body to `len` bytes starting at `offset`, clipped to
    /// the current extent.
    pub fn range(mut self, offset: u64, len: u64) -> Self {
        let end = self.offset.saturating_add(self.len);
        self.offset = self.offset.saturating_add(offset).min(end);
        self.len = len.min(end - self.offset);
        self
    }

    /// Overrides the configured chunk size for this body.
    pub fn chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Destination of file chunks.
pub trait SendfileSink {
    /// Transmits up to `len` bytes of `file` starting at `offset`.
    /// `ErrorKind::WouldBlock` means "not writable right now".
    fn send_chunk(&mut self, file: &File, offset: u64, len: usize) -> io::Result<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// Every byte has been transmitted; total count.
    Done(u64),
    /// The sink would block; resume after write readiness.
    WouldBlock,
}

#[derive(Debug)]
pub struct SendfileOperation {
    file: Arc<File>,
    offset: u64,
    remaining: u64,
    chunk: u64,
    transferred: u64,
    deadline: Instant,
}

impl SendfileOperation {
    pub fn new(body: &FileBody, config: &SendfileConfig) -> Self {
        let chunk = match body.chunk_size {
            Some(chunk) => clamp_chunk_size(chunk),
            None => config.effective_chunk_size(),
        };
        Self::with_deadline(body, chunk, Instant::now() + config.timelimit)
    }

    pub fn with_deadline(body: &FileBody, chunk: u64, deadline: Instant) -> Self {
        Self {
            file: Arc::clone(&body.file),
            offset: body.offset,
            remaining: body.len,
            chunk: clamp_chunk_size(chunk),
            transferred: 0,
            deadline,
        }
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_done(&self) -> bool {
        self.remaining == 0
    }

    /// Length of the next chunk: never crosses a multiple of the chunk size.
    pub fn next_chunk_len(&self) -> usize {
        let into_chunk = self.transferred % self.chunk;
        let len = (self.chunk - into_chunk).min(self.remaining);
        usize::try_from(len).unwrap_or(usize::MAX)
    }

    /// Records `n` bytes as transmitted.
    pub fn advance(&mut self, n: u64) {
        let n = n.min(self.remaining);
        self.offset += n;
        self.remaining -= n;
        self.transferred += n;
    }

    pub fn check_deadline(&self) -> io::Result<()> {
        if Instant::now() >= self.deadline {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "sendfile time limit exceeded"));
        }
        Ok(())
    }

    /// Sends chunks until the file is done or the sink would block.
    pub fn resume<S: SendfileSink>(&mut self, sink: &mut S) -> io::Result<Resume> {
        while !self.is_done() {
            self.check_deadline()?;

            let len = self.next_chunk_len();
            match sink.send_chunk(&self.file, self.offset, len) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "file ended before the announced length",
                    ));
                }
                Ok(n) => self.advance(n as u64),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Resume::WouldBlock),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(Resume::Done(self.transferred))
    }
}

/// Copies the file through user space: read a chunk, write it out.
/// Used by transports without a zero-copy path.
pub async fn copy_file_chunks<W>(writer: &mut W, op: &mut SendfileOperation) -> io::Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = Vec::new();
    while !op.is_done() {
        op.check_deadline()?;

        let len = op.next_chunk_len();
        buf.resize(len, 0);
        let n = read_at(op.file(), &mut buf, op.offset())?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file ended before the announced length",
            ));
        }

        tokio::time::timeout_at(op.deadline(), writer.write_all(&buf[..n]))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "sendfile time limit exceeded"))??;
        op.advance(n as u64);
    }
    writer.flush().await?;
    Ok(op.transferred())
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    loop {
        match file.read_at(buf, offset) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

#[cfg(not(unix))]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = file;
    file.seek(SeekFrom::Start(offset))?;
    file.read(buf)
}
