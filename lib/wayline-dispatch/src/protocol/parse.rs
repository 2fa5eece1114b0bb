/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io;
use std::str::Utf8Error;

use atoi::FromRadix10;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

#[derive(Debug, Error)]
pub enum HttpLineParseError {
    #[error("not long enough")]
    NotLongEnough,
    #[error("no delimiter '{0}' found")]
    NoDelimiterFound(char),
    #[error("invalid http version")]
    InvalidVersion,
    #[error("invalid status code")]
    InvalidStatusCode,
    #[error("invalid header name")]
    InvalidHeaderName,
    #[error("invalid header value")]
    InvalidHeaderValue,
    #[error("invalid chunk size")]
    InvalidChunkSize,
    #[error("invalid utf-8 encoding: {0}")]
    InvalidUtf8Encoding(#[from] Utf8Error),
}

pub struct HttpStatusLine<'a> {
    pub version: u8,
    pub code: u16,
    pub reason: &'a str,
}

impl<'a> HttpStatusLine<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<HttpStatusLine<'a>, HttpLineParseError> {
        const MINIMAL_LENGTH: usize = 13; // HTTP/1.x XYZ\n

        if buf.len() < MINIMAL_LENGTH {
            return Err(HttpLineParseError::NotLongEnough);
        }

        let Some(p) = memchr::memchr(b' ', buf) else {
            return Err(HttpLineParseError::NoDelimiterFound(' '));
        };
        let version: u8 = match &buf[0..p] {
            b"HTTP/1.0" => 0,
            b"HTTP/1.1" => 1,
            _ => return Err(HttpLineParseError::InvalidVersion),
        };

        let left = &buf[p + 1..];
        let (code, len) = u16::from_radix_10(left);
        if len < 3 {
            return Err(HttpLineParseError::InvalidStatusCode);
        }

        if left.len() < len + 1 {
            return Err(HttpLineParseError::NotLongEnough);
        }
        let reason = std::str::from_utf8(&left[len + 1..])?.trim();

        Ok(HttpStatusLine {
            version,
            code,
            reason,
        })
    }
}

pub struct HttpHeaderLine<'a> {
    pub name: &'a str,
    pub value: &'a str,
}

impl<'a> HttpHeaderLine<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<HttpHeaderLine<'a>, HttpLineParseError> {
        let Some(p) = memchr::memchr(b':', buf) else {
            return Err(HttpLineParseError::NoDelimiterFound(':'));
        };
        let name = std::str::from_utf8(&buf[0..p])?.trim();
        if name.is_empty() {
            return Err(HttpLineParseError::InvalidHeaderName);
        }
        let value = std::str::from_utf8(&buf[p + 1..])?.trim();
        Ok(HttpHeaderLine { name, value })
    }
}

/// Parse a chunk-size line, ignoring any chunk extensions.
pub fn parse_chunk_size(line: &[u8]) -> Result<u64, HttpLineParseError> {
    let line = trim_line_end(line);
    let hex = match memchr::memchr(b';', line) {
        Some(p) => &line[0..p],
        None => line,
    };
    let hex = std::str::from_utf8(hex)?.trim();
    if hex.is_empty() {
        return Err(HttpLineParseError::InvalidChunkSize);
    }
    u64::from_str_radix(hex, 16).map_err(|_| HttpLineParseError::InvalidChunkSize)
}

pub fn trim_line_end(line: &[u8]) -> &[u8] {
    match line {
        [head @ .., b'\r', b'\n'] => head,
        [head @ .., b'\n'] => head,
        _ => line,
    }
}

pub fn is_line_end(line: &[u8]) -> bool {
    trim_line_end(line).is_empty()
}

/// Read bytes up to and including `delimiter` into `buf`, never consuming
/// more than `max_len` bytes from the reader.
///
/// Returns whether the delimiter was found and the number of bytes read.
pub(crate) async fn limited_read_until<R>(
    reader: &mut R,
    delimiter: u8,
    max_len: usize,
    buf: &mut Vec<u8>,
) -> io::Result<(bool, usize)>
where
    R: AsyncBufRead + Unpin,
{
    let mut total: usize = 0;
    loop {
        if total >= max_len {
            return Ok((false, total));
        }
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok((false, total));
        }
        let window = available.len().min(max_len - total);
        if let Some(p) = memchr::memchr(delimiter, &available[0..window]) {
            buf.extend_from_slice(&available[0..=p]);
            reader.consume(p + 1);
            return Ok((true, total + p + 1));
        }
        buf.extend_from_slice(&available[0..window]);
        reader.consume(window);
        total += window;
    }
}
