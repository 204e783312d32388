//! Message boundary tracking for one direction of a connection
//!
//! Bytes arrive in arbitrary chunks. The framer turns them into whole
//! protocol messages: a message that is already fully buffered is split off
//! the read buffer without copying, a message that straddles reads is
//! accumulated in a staging buffer that grows as its bytes arrive.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{FrameError, ProtocolError};
use crate::protocol::parse_header;

/// Most a staging buffer reserves ahead of the bytes actually received
const STAGING_STEP: usize = 64 * 1024;

#[derive(Debug)]
pub struct Framer {
    buf: BytesMut,
    /// Partially received message
    staging: Option<BytesMut>,
    /// Bytes of the staged message still to come (0 at a boundary)
    bytes_left: usize,
    readahead: usize,
}

impl Framer {
    #[must_use]
    pub fn new(readahead: usize) -> Self {
        Self::with_buffer(BytesMut::with_capacity(readahead), readahead)
    }

    /// Wrap a (pooled) read buffer
    #[must_use]
    pub fn with_buffer(buf: BytesMut, readahead: usize) -> Self {
        Self {
            buf,
            staging: None,
            bytes_left: 0,
            readahead: readahead.max(crate::protocol::HEADER_LEN),
        }
    }

    /// Give the read buffer back, e.g. to a [`super::BufferPool`]
    #[must_use]
    pub fn into_buffer(self) -> BytesMut {
        self.buf
    }

    /// No message is partially received
    #[inline]
    #[must_use]
    pub fn at_boundary(&self) -> bool {
        self.bytes_left == 0
    }

    /// Bytes read but not yet handed out
    #[inline]
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Tag of the next message, if its first byte has arrived
    #[must_use]
    pub fn peek_tag(&self) -> Option<u8> {
        if self.at_boundary() {
            self.buf.first().copied()
        } else {
            self.staging.as_ref().and_then(|s| s.first().copied())
        }
    }

    /// Take the next complete message out of the buffered bytes
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        if self.bytes_left > 0 {
            let take = self.bytes_left.min(self.buf.len());
            if let Some(staging) = self.staging.as_mut() {
                staging.extend_from_slice(&self.buf.split_to(take));
            }
            self.bytes_left -= take;
        }
        if self.bytes_left > 0 {
            return Ok(None);
        }
        if let Some(staged) = self.staging.take() {
            return Ok(Some(staged.freeze()));
        }

        let Some((_, total)) = parse_header(&self.buf)? else {
            return Ok(None);
        };
        if self.buf.len() >= total {
            return Ok(Some(self.buf.split_to(total).freeze()));
        }

        // the declared length is untrusted until the bytes show up
        let mut staging = BytesMut::with_capacity(total.min(self.staging_step()));
        staging.extend_from_slice(&self.buf);
        self.bytes_left = total - self.buf.len();
        self.buf.clear();
        self.staging = Some(staging);
        Ok(None)
    }

    fn staging_step(&self) -> usize {
        STAGING_STEP.max(self.readahead)
    }

    /// Read more bytes from `io`
    ///
    /// While a large message is being staged the read goes straight into the
    /// staging buffer. Cancel safe: nothing is lost if the future is dropped.
    pub async fn fill<R>(&mut self, io: &mut R) -> Result<usize, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        let direct = self.bytes_left > 0 && self.buf.is_empty();
        let step = self.staging_step();
        let n = match self.staging.as_mut() {
            Some(staging) if direct => {
                staging.reserve(self.bytes_left.min(step));
                let mut limited = staging.limit(self.bytes_left);
                io.read_buf(&mut limited).await?
            }
            _ => {
                self.buf.reserve(self.readahead);
                io.read_buf(&mut self.buf).await?
            }
        };
        if n == 0 {
            return Err(FrameError::Closed);
        }
        if direct && self.staging.is_some() {
            self.bytes_left -= n;
        }
        Ok(n)
    }

    /// Read until one complete message is available
    pub async fn read_frame<R>(&mut self, io: &mut R) -> Result<Bytes, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(frame) = self.next_frame()? {
                return Ok(frame);
            }
            self.fill(io).await?;
        }
    }
}
