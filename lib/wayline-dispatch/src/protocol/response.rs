/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io;
use std::str::FromStr;

use http::{HeaderMap, HeaderName, HeaderValue, Method, Version, header};
use thiserror::Error;
use tokio::io::AsyncBufRead;

use super::parse::{HttpHeaderLine, HttpLineParseError, HttpStatusLine, limited_read_until};
use crate::body::HttpBodyType;

#[derive(Debug, Error)]
pub enum HttpResponseParseError {
    #[error("remote closed")]
    RemoteClosed,
    #[error("too large header, should be less than {0}")]
    TooLargeHeader(usize),
    #[error("invalid status line: {0}")]
    InvalidStatusLine(HttpLineParseError),
    #[error("invalid header line: {0}")]
    InvalidHeaderLine(HttpLineParseError),
    #[error("invalid chunked transfer-encoding")]
    InvalidChunkedTransferEncoding,
    #[error("invalid content length")]
    InvalidContentLength,
    #[error("io failed: {0:?}")]
    IoFailed(#[from] io::Error),
}

/// A parsed backend response head.
///
/// Connection-control and framing headers are tracked in dedicated fields
/// and never appear in `headers`; the dispatcher re-frames the body when
/// writing back to the client.
pub struct RemoteResponse {
    pub version: Version,
    pub code: u16,
    pub reason: String,
    pub headers: HeaderMap,
    origin_header_size: usize,
    keep_alive: bool,
    content_length: u64,
    chunked_transfer: bool,
    has_transfer_encoding: bool,
    has_content_length: bool,
}

impl RemoteResponse {
    fn new(version: Version, code: u16, reason: String) -> Self {
        let keep_alive = version == Version::HTTP_11;
        RemoteResponse {
            version,
            code,
            reason,
            headers: HeaderMap::new(),
            origin_header_size: 0,
            keep_alive,
            content_length: 0,
            chunked_transfer: false,
            has_transfer_encoding: false,
            has_content_length: false,
        }
    }

    #[inline]
    pub fn origin_header_size(&self) -> usize {
        self.origin_header_size
    }

    #[inline]
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// The content length the backend declared, if any; meaningful even
    /// when no body follows (e.g. a HEAD response).
    pub fn declared_content_length(&self) -> Option<u64> {
        self.has_content_length.then_some(self.content_length)
    }

    #[inline]
    pub fn is_chunked(&self) -> bool {
        self.chunked_transfer
    }

    fn expect_no_body(&self, method: &Method) -> bool {
        self.code < 200 || self.code == 204 || self.code == 304 || method.eq(&Method::HEAD)
    }

    pub fn body_type(&self, method: &Method) -> Option<HttpBodyType> {
        if self.expect_no_body(method) {
            None
        } else if self.chunked_transfer {
            Some(HttpBodyType::Chunked)
        } else if self.has_content_length {
            if self.content_length > 0 {
                Some(HttpBodyType::ContentLength(self.content_length))
            } else {
                None
            }
        } else {
            Some(HttpBodyType::ReadUntilEnd)
        }
    }

    pub fn location(&self) -> Option<&str> {
        self.headers
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
    }

    pub async fn parse<R>(
        reader: &mut R,
        method: &Method,
        max_header_size: usize,
    ) -> Result<Self, HttpResponseParseError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut line_buf = Vec::<u8>::with_capacity(1024);
        let mut header_size: usize = 0;

        let (found, nr) =
            limited_read_until(reader, b'\n', max_header_size, &mut line_buf).await?;
        if nr == 0 {
            return Err(HttpResponseParseError::RemoteClosed);
        }
        if !found {
            return if nr < max_header_size {
                Err(HttpResponseParseError::RemoteClosed)
            } else {
                Err(HttpResponseParseError::TooLargeHeader(max_header_size))
            };
        }
        header_size += nr;

        let mut rsp = RemoteResponse::build_from_status_line(line_buf.as_ref())?;

        loop {
            if header_size >= max_header_size {
                return Err(HttpResponseParseError::TooLargeHeader(max_header_size));
            }
            line_buf.clear();
            let max_len = max_header_size - header_size;
            let (found, nr) = limited_read_until(reader, b'\n', max_len, &mut line_buf).await?;
            if nr == 0 {
                return Err(HttpResponseParseError::RemoteClosed);
            }
            if !found {
                return if nr < max_len {
                    Err(HttpResponseParseError::RemoteClosed)
                } else {
                    Err(HttpResponseParseError::TooLargeHeader(max_header_size))
                };
            }
            header_size += nr;
            if (line_buf.len() == 1 && line_buf[0] == b'\n')
                || (line_buf.len() == 2 && line_buf[0] == b'\r' && line_buf[1] == b'\n')
            {
                break;
            }

            rsp.parse_header_line(line_buf.as_ref())?;
        }
        rsp.origin_header_size = header_size;

        Ok(rsp)
    }

    fn build_from_status_line(line_buf: &[u8]) -> Result<Self, HttpResponseParseError> {
        let rsp =
            HttpStatusLine::parse(line_buf).map_err(HttpResponseParseError::InvalidStatusLine)?;
        let version = match rsp.version {
            0 => Version::HTTP_10,
            1 => Version::HTTP_11,
            _ => unreachable!(),
        };
        Ok(RemoteResponse::new(
            version,
            rsp.code,
            rsp.reason.to_string(),
        ))
    }

    fn parse_header_line(&mut self, line_buf: &[u8]) -> Result<(), HttpResponseParseError> {
        let header =
            HttpHeaderLine::parse(line_buf).map_err(HttpResponseParseError::InvalidHeaderLine)?;

        let name = HeaderName::from_str(header.name).map_err(|_| {
            HttpResponseParseError::InvalidHeaderLine(HttpLineParseError::InvalidHeaderName)
        })?;

        match name.as_str() {
            "connection" => {
                for v in header.value.to_lowercase().split(',') {
                    match v.trim() {
                        "keep-alive" => self.keep_alive = true,
                        "close" => self.keep_alive = false,
                        _ => {}
                    }
                }
                return Ok(());
            }
            "keep-alive" | "proxy-connection" => return Ok(()),
            "transfer-encoding" => {
                self.has_transfer_encoding = true;
                if self.has_content_length {
                    // content-length loses, according to rfc9112 Section 6.1
                    self.content_length = 0;
                    self.has_content_length = false;
                }
                let v = header.value.to_lowercase();
                if v.ends_with("chunked") {
                    self.chunked_transfer = true;
                } else {
                    return Err(HttpResponseParseError::InvalidChunkedTransferEncoding);
                }
                return Ok(());
            }
            "content-length" => {
                if self.has_transfer_encoding {
                    return Ok(());
                }
                let content_length = u64::from_str(header.value)
                    .map_err(|_| HttpResponseParseError::InvalidContentLength)?;
                if self.has_content_length && self.content_length != content_length {
                    return Err(HttpResponseParseError::InvalidContentLength);
                }
                self.has_content_length = true;
                self.content_length = content_length;
                return Ok(());
            }
            "trailer" => return Ok(()),
            _ => {}
        }

        let value = HeaderValue::from_str(header.value).map_err(|_| {
            HttpResponseParseError::InvalidHeaderLine(HttpLineParseError::InvalidHeaderValue)
        })?;
        self.headers.append(name, value);
        Ok(())
    }
}
