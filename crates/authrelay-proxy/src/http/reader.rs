use super::{BodyFraming, MAX_BUFFERED_BODY, MAX_HEAD_SIZE};
use crate::error::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_CHUNK: usize = 8 * 1024;
const MAX_CHUNK_LINE: usize = 4 * 1024;

/// Buffered reader of HTTP/1.x message heads and bodies.
///
/// Bodies are moved as raw bytes, chunk framing included, so they can be
/// forwarded exactly as received.
#[derive(Debug)]
pub struct MessageReader<R> {
    inner: R,
    buf: BytesMut,
    body_limit: usize,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
            body_limit: MAX_BUFFERED_BODY,
        }
    }

    /// Cap on bodies read with [`read_body`](Self::read_body).
    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    /// Bytes read from the stream but not consumed yet.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_parts(self) -> (R, BytesMut) {
        (self.inner, self.buf)
    }

    async fn fill(&mut self) -> io::Result<usize> {
        self.buf.reserve(READ_CHUNK);
        self.inner.read_buf(&mut self.buf).await
    }

    /// Read the next message head, terminating empty line included.
    ///
    /// Returns `None` when the peer closed the stream between messages.
    pub async fn read_head(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(end) = find_head_end(&self.buf) {
                return Ok(Some(self.buf.split_to(end).freeze()));
            }
            if self.buf.len() > MAX_HEAD_SIZE {
                return Err(Error::HeadTooLarge(MAX_HEAD_SIZE));
            }
            if self.fill().await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed inside a message head",
                )
                .into());
            }
        }
    }

    /// Read a whole body into memory, failing with `BodyTooLarge` past the limit.
    pub async fn read_body(&mut self, framing: BodyFraming) -> Result<Bytes> {
        let limit = self.body_limit;
        if let BodyFraming::Length(n) = framing {
            if n > limit as u64 {
                return Err(Error::BodyTooLarge(limit));
            }
        }
        let mut body = BoundedBuffer::new(limit);
        let copied = self.copy_body(framing, &mut body).await;
        match copied {
            Ok(_) => Ok(Bytes::from(body.data)),
            Err(_) if body.overflowed => Err(Error::BodyTooLarge(limit)),
            Err(e) => Err(e),
        }
    }

    /// Discard a body, leaving the stream at the next message.
    pub async fn skip_body(&mut self, framing: BodyFraming) -> Result<u64> {
        self.copy_body(framing, &mut tokio::io::sink()).await
    }

    /// Copy a body to `out` as it arrives. Returns the number of bytes copied.
    pub async fn copy_body<W>(&mut self, framing: BodyFraming, out: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let copied = match framing {
            BodyFraming::None => 0,
            BodyFraming::Length(n) => self.copy_exact(n, out).await?,
            BodyFraming::UntilClose => self.copy_until_close(out).await?,
            BodyFraming::Chunked => self.copy_chunked(out).await?,
        };
        out.flush().await?;
        Ok(copied)
    }

    async fn copy_exact<W>(&mut self, len: u64, out: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut remaining = len;
        while remaining > 0 {
            if self.buf.is_empty() && self.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream closed with {remaining} body bytes outstanding"),
                )
                .into());
            }
            let take = remaining.min(self.buf.len() as u64) as usize;
            out.write_all(&self.buf[..take]).await?;
            self.buf.advance(take);
            remaining -= take as u64;
        }
        Ok(len)
    }

    async fn copy_until_close<W>(&mut self, out: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut copied = 0u64;
        loop {
            if !self.buf.is_empty() {
                out.write_all(&self.buf).await?;
                copied += self.buf.len() as u64;
                self.buf.clear();
            }
            if self.fill().await? == 0 {
                return Ok(copied);
            }
        }
    }

    async fn copy_chunked<W>(&mut self, out: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut copied = 0u64;
        loop {
            let line = self.read_line().await?;
            let size = parse_chunk_size(&line)?;
            out.write_all(&line).await?;
            copied += line.len() as u64;

            if size == 0 {
                // Trailer section up to the final empty line.
                loop {
                    let trailer = self.read_line().await?;
                    out.write_all(&trailer).await?;
                    copied += trailer.len() as u64;
                    if trailer.as_ref() == b"\r\n" || trailer.as_ref() == b"\n" {
                        return Ok(copied);
                    }
                }
            }

            // Chunk data and its CRLF.
            copied += self.copy_exact(size + 2, out).await?;
        }
    }

    async fn read_line(&mut self) -> Result<Bytes> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                return Ok(self.buf.split_to(pos + 1).freeze());
            }
            if self.buf.len() > MAX_CHUNK_LINE {
                return Err(Error::MalformedResponse("chunk line too long".into()));
            }
            if self.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed inside chunked body",
                )
                .into());
            }
        }
    }
}

/// In-memory sink that refuses to grow past `limit`.
struct BoundedBuffer {
    data: Vec<u8>,
    limit: usize,
    overflowed: bool,
}

impl BoundedBuffer {
    fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            overflowed: false,
        }
    }
}

impl AsyncWrite for BoundedBuffer {
    fn poll_write(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if self.data.len() + buf.len() > self.limit {
            self.overflowed = true;
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "body exceeds buffer limit",
            )));
        }
        self.data.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4);
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|i| i + 2);
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let text = std::str::from_utf8(line)
        .map_err(|_| Error::MalformedResponse("chunk size is not ASCII".into()))?;
    let size = text.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(size, 16)
        .map_err(|_| Error::MalformedResponse(format!("invalid chunk size '{size}'")))
}
