/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, ready};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

pub type BoxBodyReader = Box<dyn AsyncRead + Send + Unpin>;

pub const DEFAULT_REPLAY_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReplayError {
    #[error("already past replay buffer capacity")]
    CapacityExceeded,
    #[error("stream taken over by another consumer")]
    TakenOver,
    #[error("request body is not repeatable")]
    NotRepeatable,
}

/// Declared framing of a request body handed over by the hosting server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyTransfer {
    Sized(u64),
    Chunked,
}

/// An outbound request body.
///
/// `Stream` is a plain one-shot body: it can be sent exactly once.
/// `Replay` keeps up to a fixed number of leading bytes around so a retry
/// attempt can re-send the body even though the source stream cannot seek.
pub enum RequestEntity {
    Stream(StreamEntity),
    Replay(ReplayEntity),
}

impl RequestEntity {
    pub fn new_stream(reader: BoxBodyReader, transfer: BodyTransfer) -> Self {
        RequestEntity::Stream(StreamEntity {
            reader: Some(reader),
            transfer,
        })
    }

    pub fn new_replay(reader: BoxBodyReader, transfer: BodyTransfer, capacity: usize) -> Self {
        RequestEntity::Replay(ReplayEntity::new(reader, transfer, capacity))
    }

    pub fn transfer(&self) -> BodyTransfer {
        match self {
            RequestEntity::Stream(e) => e.transfer,
            RequestEntity::Replay(e) => e.transfer,
        }
    }

    /// Whether a further `reader()` call can still produce the full body:
    /// a one-shot body only until its reader is taken, a replayable body
    /// until a reader has consumed past the buffer capacity.
    pub fn is_repeatable(&self) -> bool {
        match self {
            RequestEntity::Stream(e) => e.reader.is_some(),
            RequestEntity::Replay(e) => !e.shared.lock_state().finalized,
        }
    }

    /// Open a reader over the body content, replaying captured bytes first.
    pub fn reader(&mut self) -> Result<EntityReader, ReplayError> {
        match self {
            RequestEntity::Stream(e) => match e.reader.take() {
                Some(r) => Ok(EntityReader::Once(r)),
                None => Err(ReplayError::NotRepeatable),
            },
            RequestEntity::Replay(e) => e.reader().map(EntityReader::Replay),
        }
    }

    /// Fully drain the body content into `writer`.
    pub async fn write_to<W>(&mut self, writer: &mut W) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut reader = self.reader().map_err(io::Error::other)?;
        let mut buf = [0u8; 8192];
        let mut total = 0u64;
        loop {
            let nr = reader.read(&mut buf).await?;
            if nr == 0 {
                writer.flush().await?;
                return Ok(total);
            }
            writer.write_all(&buf[0..nr]).await?;
            total += nr as u64;
        }
    }
}

pub struct StreamEntity {
    reader: Option<BoxBodyReader>,
    transfer: BodyTransfer,
}

pub struct ReplayEntity {
    shared: Arc<ReplayShared>,
    transfer: BodyTransfer,
}

impl ReplayEntity {
    fn new(reader: BoxBodyReader, transfer: BodyTransfer, capacity: usize) -> Self {
        ReplayEntity {
            shared: Arc::new(ReplayShared {
                state: Mutex::new(ReplayState {
                    inner: reader,
                    buf: Vec::with_capacity(capacity),
                    capacity,
                    finalized: false,
                    owner: 0,
                    next_reader_id: 0,
                }),
            }),
            transfer,
        }
    }

    fn reader(&self) -> Result<ReplayReader, ReplayError> {
        let mut state = self.shared.lock_state();
        if state.finalized {
            return Err(ReplayError::CapacityExceeded);
        }
        let id = state.next_reader_id;
        state.next_reader_id += 1;
        Ok(ReplayReader {
            shared: Arc::clone(&self.shared),
            id,
            offset: 0,
        })
    }
}

struct ReplayShared {
    state: Mutex<ReplayState>,
}

impl ReplayShared {
    fn lock_state(&self) -> MutexGuard<'_, ReplayState> {
        // a poisoned lock means a reader panicked mid-poll; nothing to salvage
        match self.state.lock() {
            Ok(guard) => guard,
            Err(e) => e.into_inner(),
        }
    }
}

struct ReplayState {
    inner: BoxBodyReader,
    buf: Vec<u8>,
    capacity: usize,
    finalized: bool,
    owner: u32,
    next_reader_id: u32,
}

/// One logical read pass over a replay entity.
///
/// Replays already captured bytes from offset 0, then continues from the
/// inner stream, capturing newly read bytes until the shared capacity is
/// reached. The reader that first consumes past the capacity finalizes the
/// entity and becomes its sole permitted consumer.
pub struct ReplayReader {
    shared: Arc<ReplayShared>,
    id: u32,
    offset: usize,
}

impl AsyncRead for ReplayReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let shared = Arc::clone(&this.shared);
        let mut state = shared.lock_state();
        let state = &mut *state;

        if state.finalized && state.owner != this.id {
            return Poll::Ready(Err(io::Error::other(ReplayError::TakenOver)));
        }

        if this.offset < state.buf.len() {
            // replay from the capture buffer
            let cached = &state.buf[this.offset..];
            let nr = cached.len().min(buf.remaining());
            buf.put_slice(&cached[0..nr]);
            this.offset += nr;
            return Poll::Ready(Ok(()));
        }

        // continue from the inner stream
        let filled_before = buf.filled().len();
        ready!(Pin::new(&mut state.inner).poll_read(cx, buf))?;
        let nr = buf.filled().len() - filled_before;
        if nr == 0 {
            return Poll::Ready(Ok(()));
        }
        if !state.finalized {
            let data = &buf.filled()[filled_before..];
            let room = state.capacity - state.buf.len();
            let keep = nr.min(room);
            state.buf.extend_from_slice(&data[0..keep]);
            if keep < nr {
                // bytes beyond the capacity are gone for everyone else
                state.finalized = true;
                state.owner = this.id;
            }
        }
        this.offset += nr;
        Poll::Ready(Ok(()))
    }
}

pub enum EntityReader {
    Once(BoxBodyReader),
    Replay(ReplayReader),
}

impl AsyncRead for EntityReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            EntityReader::Once(r) => Pin::new(r).poll_read(cx, buf),
            EntityReader::Replay(r) => Pin::new(r).poll_read(cx, buf),
        }
    }
}
