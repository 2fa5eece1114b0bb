/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io::{self, Write};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

pub mod replay;

use crate::protocol::parse::{is_line_end, parse_chunk_size};

const BODY_LINE_MAX_LEN: usize = 1024;
const COPY_BUF_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpBodyType {
    ContentLength(u64),
    Chunked,
    ReadUntilEnd,
}

enum ChunkedState {
    SizeLine,
    Data,
    DataEnd,
    TrailerLine,
    Finished,
}

/// Decodes a backend response body from its wire framing.
///
/// Yields payload bytes only; chunk framing and trailer lines are consumed
/// and dropped, so the caller re-frames the body when forwarding it.
pub struct HttpBodyReader<R> {
    stream: R,
    body_type: HttpBodyType,
    chunked_state: ChunkedState,
    left: u64,
    line_buf: Vec<u8>,
    finished: bool,
}

impl<R> HttpBodyReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(stream: R, body_type: HttpBodyType) -> Self {
        let mut left = 0u64;
        if let HttpBodyType::ContentLength(size) = body_type {
            left = size;
        }
        HttpBodyReader {
            stream,
            body_type,
            chunked_state: ChunkedState::SizeLine,
            left,
            line_buf: Vec::with_capacity(64),
            finished: false,
        }
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    /// read a full line (ending in b'\n') into line_buf
    fn poll_line(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            let mut reader = Pin::new(&mut self.stream);
            let cache = ready!(reader.as_mut().poll_fill_buf(cx))?;
            if cache.is_empty() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "reader closed while reading chunk line",
                )));
            }
            match memchr::memchr(b'\n', cache) {
                Some(p) => {
                    if self.line_buf.len() + p + 1 > BODY_LINE_MAX_LEN {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "chunk line too long",
                        )));
                    }
                    self.line_buf.extend_from_slice(&cache[0..=p]);
                    reader.as_mut().consume(p + 1);
                    return Poll::Ready(Ok(()));
                }
                None => {
                    let nr = cache.len();
                    if self.line_buf.len() + nr > BODY_LINE_MAX_LEN {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "chunk line too long",
                        )));
                    }
                    self.line_buf.extend_from_slice(cache);
                    reader.as_mut().consume(nr);
                }
            }
        }
    }

    fn poll_eof(&mut self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let old_remaining = buf.remaining();
        ready!(Pin::new(&mut self.stream).poll_read(cx, buf))?;
        if old_remaining - buf.remaining() == 0 {
            // io closed, which indicates the end of body
            self.finished = true;
        }
        Poll::Ready(Ok(()))
    }

    fn poll_fixed(&mut self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if self.left == 0 {
            self.finished = true;
            return Poll::Ready(Ok(()));
        }
        let max = buf.remaining().min(u64_to_usize(self.left));
        let mut limited_buf = ReadBuf::new(buf.initialize_unfilled_to(max));
        ready!(Pin::new(&mut self.stream).poll_read(cx, &mut limited_buf))?;
        let nr = limited_buf.filled().len();
        if nr == 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "reader closed while reading fixed length body",
            )));
        }
        buf.advance(nr);
        self.left -= nr as u64;
        if self.left == 0 {
            self.finished = true;
        }
        Poll::Ready(Ok(()))
    }

    fn poll_chunked(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            match self.chunked_state {
                ChunkedState::SizeLine => {
                    ready!(self.poll_line(cx))?;
                    let size = parse_chunk_size(&self.line_buf)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    self.line_buf.clear();
                    if size == 0 {
                        self.chunked_state = ChunkedState::TrailerLine;
                    } else {
                        self.left = size;
                        self.chunked_state = ChunkedState::Data;
                    }
                }
                ChunkedState::Data => {
                    let max = buf.remaining().min(u64_to_usize(self.left));
                    let mut limited_buf = ReadBuf::new(buf.initialize_unfilled_to(max));
                    ready!(Pin::new(&mut self.stream).poll_read(cx, &mut limited_buf))?;
                    let nr = limited_buf.filled().len();
                    if nr == 0 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "reader closed while reading chunk data",
                        )));
                    }
                    buf.advance(nr);
                    self.left -= nr as u64;
                    if self.left == 0 {
                        self.chunked_state = ChunkedState::DataEnd;
                    }
                    return Poll::Ready(Ok(()));
                }
                ChunkedState::DataEnd => {
                    ready!(self.poll_line(cx))?;
                    if !is_line_end(&self.line_buf) {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "invalid chunk ending",
                        )));
                    }
                    self.line_buf.clear();
                    self.chunked_state = ChunkedState::SizeLine;
                }
                ChunkedState::TrailerLine => {
                    ready!(self.poll_line(cx))?;
                    let end = is_line_end(&self.line_buf);
                    self.line_buf.clear();
                    if end {
                        self.chunked_state = ChunkedState::Finished;
                    }
                }
                ChunkedState::Finished => {
                    self.finished = true;
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl<R> AsyncRead for HttpBodyReader<R>
where
    R: AsyncBufRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.finished || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        match this.body_type {
            HttpBodyType::ReadUntilEnd => this.poll_eof(cx, buf),
            HttpBodyType::ContentLength(_) => this.poll_fixed(cx, buf),
            HttpBodyType::Chunked => this.poll_chunked(cx, buf),
        }
    }
}

fn u64_to_usize(v: u64) -> usize {
    v.min(usize::MAX as u64) as usize
}

/// Copy exactly `len` raw bytes from `reader` to `writer`.
pub(crate) async fn send_sized<R, W>(reader: &mut R, writer: &mut W, len: u64) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; COPY_BUF_SIZE];
    let mut left = len;
    while left > 0 {
        let max = buf.len().min(u64_to_usize(left));
        let nr = reader.read(&mut buf[0..max]).await?;
        if nr == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "body closed before the declared length",
            ));
        }
        writer.write_all(&buf[0..nr]).await?;
        left -= nr as u64;
    }
    Ok(len - left)
}

/// Copy all bytes from `reader` to `writer` in chunked transfer encoding.
pub(crate) async fn send_chunked<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; COPY_BUF_SIZE];
    let mut head = Vec::<u8>::with_capacity(16);
    let mut total = 0u64;
    loop {
        let nr = reader.read(&mut buf).await?;
        if nr == 0 {
            writer.write_all(b"0\r\n\r\n").await?;
            return Ok(total);
        }
        head.clear();
        let _ = write!(&mut head, "{nr:x}\r\n");
        writer.write_all(&head).await?;
        writer.write_all(&buf[0..nr]).await?;
        writer.write_all(b"\r\n").await?;
        total += nr as u64;
    }
}
