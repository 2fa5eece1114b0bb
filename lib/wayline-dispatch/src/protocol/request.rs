/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io::Write;
use std::net::IpAddr;

use bytes::BufMut;
use http::{HeaderMap, Method, Uri};
use url::Url;
use uuid::Uuid;

use crate::body::replay::{BodyTransfer, BoxBodyReader, RequestEntity};

/// Request-scoped dispatch state, carried across retry attempts.
///
/// The failover counter starts at 0 and only ever grows; the resolved
/// target is cleared whenever a retry forces re-resolution.
pub struct RequestContext {
    pub(crate) id: Uuid,
    pub(crate) failover_count: u32,
    pub(crate) resolved_target: Option<Url>,
}

impl RequestContext {
    fn new() -> Self {
        RequestContext {
            id: Uuid::new_v4(),
            failover_count: 0,
            resolved_target: None,
        }
    }

    #[inline]
    pub fn id(&self) -> &Uuid {
        &self.id
    }

    #[inline]
    pub fn failover_count(&self) -> u32 {
        self.failover_count
    }

    #[inline]
    pub fn resolved_target(&self) -> Option<&Url> {
        self.resolved_target.as_ref()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// The inbound request as handed over by the hosting server: an already
/// parsed head plus a one-shot body reader.
pub struct ClientRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub client_addr: Option<IpAddr>,
    pub body: Option<ClientBody>,
    pub ctx: RequestContext,
}

pub struct ClientBody {
    pub reader: BoxBodyReader,
    pub transfer: BodyTransfer,
}

impl ClientRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap) -> Self {
        ClientRequest {
            method,
            uri,
            headers,
            client_addr: None,
            body: None,
            ctx: RequestContext::new(),
        }
    }

    pub fn with_body(mut self, reader: BoxBodyReader, transfer: BodyTransfer) -> Self {
        self.body = Some(ClientBody { reader, transfer });
        self
    }

    pub fn with_client_addr(mut self, addr: IpAddr) -> Self {
        self.client_addr = Some(addr);
        self
    }
}

/// The backend-facing request. The target is rewritten in place on each
/// failover retry; the entity survives attempts so its bytes can be
/// replayed.
pub struct OutboundRequest {
    pub method: Method,
    target: Url,
    headers: HeaderMap,
    body: Option<RequestEntity>,
}

impl OutboundRequest {
    pub(crate) fn new(method: Method, target: Url) -> Self {
        OutboundRequest {
            method,
            target,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    #[inline]
    pub fn target(&self) -> &Url {
        &self.target
    }

    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    #[inline]
    pub fn body(&self) -> Option<&RequestEntity> {
        self.body.as_ref()
    }

    #[inline]
    pub fn body_mut(&mut self) -> Option<&mut RequestEntity> {
        self.body.as_mut()
    }

    pub(crate) fn set_body(&mut self, entity: RequestEntity) {
        self.body = Some(entity);
    }

    /// Point this request at another backend base URL.
    ///
    /// Scheme and authority are taken from `new_base`; the path keeps its
    /// request-specific remainder with `old_base`'s path prefix swapped for
    /// `new_base`'s; the query string is preserved verbatim.
    pub(crate) fn retarget(&mut self, old_base: &Url, new_base: &Url) {
        let cur_path = self.target.path();
        let old_prefix = old_base.path().trim_end_matches('/');
        let new_path = match cur_path.strip_prefix(old_prefix) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => {
                format!("{}{}", new_base.path().trim_end_matches('/'), rest)
            }
            _ => cur_path.to_string(),
        };

        let mut target = new_base.clone();
        target.set_path(&new_path);
        target.set_query(self.target.query());
        self.target = target;
    }

    pub(crate) fn serialize_head(&self) -> Vec<u8> {
        const RESERVED_LEN_FOR_HEADERS: usize = 1024;
        let mut buf = Vec::<u8>::with_capacity(RESERVED_LEN_FOR_HEADERS);

        let path = self.target.path();
        match self.target.query() {
            Some(query) => {
                let _ = write!(buf, "{} {path}?{query} HTTP/1.1\r\n", self.method);
            }
            None => {
                let _ = write!(buf, "{} {path} HTTP/1.1\r\n", self.method);
            }
        }

        if let Some(host) = self.target.host_str() {
            match self.target.port() {
                Some(port) => {
                    let _ = write!(buf, "Host: {host}:{port}\r\n");
                }
                None => {
                    let _ = write!(buf, "Host: {host}\r\n");
                }
            }
        }

        for (name, value) in self.headers.iter() {
            buf.put_slice(name.as_ref());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }

        match &self.body {
            Some(entity) => match entity.transfer() {
                BodyTransfer::Sized(len) => {
                    let _ = write!(buf, "Content-Length: {len}\r\n");
                }
                BodyTransfer::Chunked => buf.put_slice(b"Transfer-Encoding: chunked\r\n"),
            },
            None => {
                if body_expected(&self.method) {
                    buf.put_slice(b"Content-Length: 0\r\n");
                }
            }
        }

        buf.put_slice(b"Connection: close\r\n\r\n");
        buf
    }
}

pub(crate) fn body_expected(method: &Method) -> bool {
    matches!(method, &Method::PUT | &Method::POST | &Method::PATCH)
}
