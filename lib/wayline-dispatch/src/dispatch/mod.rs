/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io::{self, Write};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderName, HeaderValue, Method, header};
use mime::Mime;
use slog::Logger;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use url::Url;

use crate::body::replay::{BodyTransfer, RequestEntity};
use crate::body::{self, HttpBodyReader, HttpBodyType};
use crate::config::{DispatchConfig, ServerDefaults};
use crate::error::{DispatchError, DispatchResult, map_send_error};
use crate::failover::{self, BackendPolicy};
use crate::log::DispatchAuditLog;
use crate::protocol::request::body_expected;
use crate::protocol::{ClientBody, ClientRequest, OutboundRequest, RemoteResponse, RequestContext};
use crate::registry::BackendRegistry;

const MAX_RESPONSE_HEADER_SIZE: usize = 65536;
const COPY_BUF_SIZE: usize = 8192;

/// Hook used to attach gateway-managed backend credentials to an outbound
/// request. Skipped when a delegation token already authorizes the call.
pub trait CredentialProvider: Send + Sync {
    fn inject(&self, outbound: &mut OutboundRequest) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchOutcome {
    pub status: u16,
    pub body_bytes: u64,
    pub failover_count: u32,
}

/// One backend exchange: the parsed response head plus the connection the
/// body is still arriving on. Dropping it releases the connection, so every
/// exit path of the write-back step closes the backend stream.
pub(crate) struct BackendExchange {
    pub(crate) method: Method,
    pub(crate) rsp: RemoteResponse,
    body: Option<ExchangeBody>,
}

struct ExchangeBody {
    reader: HttpBodyReader<BufReader<OwnedReadHalf>>,
    _writer: OwnedWriteHalf,
}

impl BackendExchange {
    fn new(
        method: Method,
        rsp: RemoteResponse,
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    ) -> Self {
        let body = rsp.body_type(&method).map(|body_type| ExchangeBody {
            reader: HttpBodyReader::new(reader, body_type),
            _writer: writer,
        });
        BackendExchange { method, rsp, body }
    }

    /// Eagerly decode up to `limit` body bytes, leaving the reader in place
    /// so forwarding can continue from where the probe stopped.
    pub(crate) async fn read_body_prefix(&mut self, limit: usize) -> io::Result<Bytes> {
        let Some(b) = &mut self.body else {
            return Ok(Bytes::new());
        };
        let mut out = BytesMut::with_capacity(limit.min(COPY_BUF_SIZE));
        let mut buf = [0u8; COPY_BUF_SIZE];
        while out.len() < limit {
            let max = buf.len().min(limit - out.len());
            let nr = b.reader.read(&mut buf[0..max]).await?;
            if nr == 0 {
                break;
            }
            out.put_slice(&buf[0..nr]);
        }
        Ok(out.freeze())
    }

    pub(crate) fn body_finished(&self) -> bool {
        match &self.body {
            Some(b) => b.reader.finished(),
            None => true,
        }
    }

    pub(crate) fn into_response(self) -> RemoteResponse {
        self.rsp
    }
}

/// Translates inbound requests into backend exchanges for one service role
/// and writes the results back to the client.
pub struct Dispatcher {
    config: DispatchConfig,
    server: ServerDefaults,
    policy: BackendPolicy,
    registry: Arc<dyn BackendRegistry + Send + Sync>,
    credentials: Option<Arc<dyn CredentialProvider + Send + Sync>>,
    logger: Option<Logger>,
}

impl Dispatcher {
    pub fn new(
        config: DispatchConfig,
        server: ServerDefaults,
        registry: Arc<dyn BackendRegistry + Send + Sync>,
    ) -> Self {
        let policy = BackendPolicy::from_config(&config);
        Dispatcher {
            config,
            server,
            policy,
            registry,
            credentials: None,
            logger: None,
        }
    }

    pub fn with_credential_provider(
        mut self,
        provider: Arc<dyn CredentialProvider + Send + Sync>,
    ) -> Self {
        self.credentials = Some(provider);
        self
    }

    pub fn with_audit_logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    #[inline]
    pub(crate) fn policy(&self) -> &BackendPolicy {
        &self.policy
    }

    #[inline]
    pub(crate) fn registry(&self) -> &Arc<dyn BackendRegistry + Send + Sync> {
        &self.registry
    }

    pub(crate) fn audit_log<'a>(&'a self, ctx: &'a RequestContext) -> Option<DispatchAuditLog<'a>> {
        self.logger.as_ref().map(|logger| DispatchAuditLog {
            logger,
            role: &self.config.role,
            ctx,
        })
    }

    pub async fn do_get<W>(
        &self,
        target: &str,
        req: ClientRequest,
        clt_w: &mut W,
    ) -> DispatchResult<DispatchOutcome>
    where
        W: AsyncWrite + Unpin,
    {
        self.dispatch(Method::GET, target, req, clt_w).await
    }

    pub async fn do_put<W>(
        &self,
        target: &str,
        req: ClientRequest,
        clt_w: &mut W,
    ) -> DispatchResult<DispatchOutcome>
    where
        W: AsyncWrite + Unpin,
    {
        self.dispatch(Method::PUT, target, req, clt_w).await
    }

    pub async fn do_post<W>(
        &self,
        target: &str,
        req: ClientRequest,
        clt_w: &mut W,
    ) -> DispatchResult<DispatchOutcome>
    where
        W: AsyncWrite + Unpin,
    {
        self.dispatch(Method::POST, target, req, clt_w).await
    }

    pub async fn do_delete<W>(
        &self,
        target: &str,
        req: ClientRequest,
        clt_w: &mut W,
    ) -> DispatchResult<DispatchOutcome>
    where
        W: AsyncWrite + Unpin,
    {
        self.dispatch(Method::DELETE, target, req, clt_w).await
    }

    pub async fn do_head<W>(
        &self,
        target: &str,
        req: ClientRequest,
        clt_w: &mut W,
    ) -> DispatchResult<DispatchOutcome>
    where
        W: AsyncWrite + Unpin,
    {
        self.dispatch(Method::HEAD, target, req, clt_w).await
    }

    pub async fn do_options<W>(
        &self,
        target: &str,
        req: ClientRequest,
        clt_w: &mut W,
    ) -> DispatchResult<DispatchOutcome>
    where
        W: AsyncWrite + Unpin,
    {
        self.dispatch(Method::OPTIONS, target, req, clt_w).await
    }

    pub async fn do_patch<W>(
        &self,
        target: &str,
        req: ClientRequest,
        clt_w: &mut W,
    ) -> DispatchResult<DispatchOutcome>
    where
        W: AsyncWrite + Unpin,
    {
        self.dispatch(Method::PATCH, target, req, clt_w).await
    }

    /// Forward one client request to the resolved target, transparently
    /// failing over to alternate backend URLs when the role is under HA
    /// management.
    pub async fn dispatch<W>(
        &self,
        method: Method,
        target: &str,
        mut req: ClientRequest,
        clt_w: &mut W,
    ) -> DispatchResult<DispatchOutcome>
    where
        W: AsyncWrite + Unpin,
    {
        let target = parse_target(target)?;
        req.ctx.resolved_target = Some(target.clone());
        let mut outbound = self.build_outbound(method, target, &mut req)?;
        let mut ctx = req.ctx;

        let mut outcome = if self.registry.is_ha_enabled(&self.config.role) {
            failover::run(self, &mut outbound, &mut ctx, clt_w).await?
        } else {
            let exchange = self.execute_outbound(&mut outbound, &ctx).await?;
            self.write_back(clt_w, exchange, None).await?
        };
        outcome.failover_count = ctx.failover_count();
        Ok(outcome)
    }

    fn build_outbound(
        &self,
        method: Method,
        target: Url,
        req: &mut ClientRequest,
    ) -> DispatchResult<OutboundRequest> {
        let mut outbound = OutboundRequest::new(method, target);

        for (name, value) in req.headers.iter() {
            if is_unforwardable(name) || self.config.excluded_request_headers.contains(name) {
                continue;
            }
            outbound.headers_mut().append(name.clone(), value.clone());
        }

        if let Some(id) = &self.config.gateway_id {
            if let Ok(v) = HeaderValue::from_str(&format!("HTTP/1.1 {id}")) {
                outbound.headers_mut().append(header::VIA, v);
            }
        }
        if let Some(addr) = req.client_addr {
            if let Ok(v) = HeaderValue::from_str(&addr.to_string()) {
                outbound
                    .headers_mut()
                    .append(HeaderName::from_static("x-forwarded-for"), v);
            }
        }

        if body_expected(&outbound.method) {
            if let Some(client_body) = req.body.take() {
                let entity = self.create_request_entity(client_body, outbound.target());
                outbound.set_body(entity);
            }
        }

        if let Some(provider) = &self.credentials {
            if !self.has_delegation_token(outbound.target()) {
                provider
                    .inject(&mut outbound)
                    .map_err(DispatchError::CredentialFailed)?;
            }
        }

        Ok(outbound)
    }

    /// Wrap the one-shot inbound body stream as a length-aware entity.
    /// Backends behind the gateway's own credential negotiation get a
    /// replay buffer so a failover retry can re-send consumed bytes.
    fn create_request_entity(&self, client_body: ClientBody, target: &Url) -> RequestEntity {
        if self.config.secured && !self.has_delegation_token(target) {
            if let Some(capacity) = self.config.replay_capacity(&self.server) {
                return RequestEntity::new_replay(client_body.reader, client_body.transfer, capacity);
            }
        }
        RequestEntity::new_stream(client_body.reader, client_body.transfer)
    }

    fn has_delegation_token(&self, target: &Url) -> bool {
        target
            .query_pairs()
            .any(|(k, _)| k == self.config.delegation_query_param.as_str())
    }

    pub(crate) async fn execute_outbound(
        &self,
        outbound: &mut OutboundRequest,
        ctx: &RequestContext,
    ) -> DispatchResult<BackendExchange> {
        let target = outbound.target().clone();
        match self.do_execute(outbound).await {
            Ok(exchange) => {
                if let Some(al) = self.audit_log(ctx) {
                    al.log_exchange(&exchange.method, &target, exchange.rsp.code);
                }
                Ok(exchange)
            }
            Err(e) => {
                if let Some(al) = self.audit_log(ctx) {
                    al.log_dispatch_failed(&outbound.method, &target, &e);
                }
                Err(e)
            }
        }
    }

    async fn do_execute(&self, outbound: &mut OutboundRequest) -> DispatchResult<BackendExchange> {
        let target = outbound.target();
        let host = target
            .host_str()
            .ok_or(DispatchError::InvalidTargetUrl("missing host"))?
            .to_string();
        let port = target.port_or_known_default().unwrap_or(80);

        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(DispatchError::ConnectFailed)?;
        let (rh, mut wh) = stream.into_split();

        wh.write_all(&outbound.serialize_head())
            .await
            .map_err(DispatchError::SendFailed)?;
        if let Some(entity) = outbound.body_mut() {
            let transfer = entity.transfer();
            let mut reader = entity.reader().map_err(DispatchError::ReplayOverflow)?;
            match transfer {
                BodyTransfer::Sized(len) => body::send_sized(&mut reader, &mut wh, len).await,
                BodyTransfer::Chunked => body::send_chunked(&mut reader, &mut wh).await,
            }
            .map_err(map_send_error)?;
        }
        wh.flush().await.map_err(DispatchError::SendFailed)?;

        let mut reader = BufReader::new(rh);
        let rsp = RemoteResponse::parse(&mut reader, &outbound.method, MAX_RESPONSE_HEADER_SIZE)
            .await
            .map_err(DispatchError::ResponseFailed)?;

        Ok(BackendExchange::new(
            outbound.method.clone(),
            rsp,
            reader,
            wh,
        ))
    }

    /// Materialize the backend response to the client: status, filtered
    /// headers, charset-amended content type, then the streamed body.
    pub(crate) async fn write_back<W>(
        &self,
        clt_w: &mut W,
        exchange: BackendExchange,
        early_body: Option<Bytes>,
    ) -> DispatchResult<DispatchOutcome>
    where
        W: AsyncWrite + Unpin,
    {
        let BackendExchange { method, rsp, body } = exchange;
        let body_type = rsp.body_type(&method);

        let mut head = Vec::<u8>::with_capacity(rsp.origin_header_size() + 256);
        self.emit_status_and_headers(&mut head, &rsp);
        match body_type {
            Some(HttpBodyType::ContentLength(len)) => {
                let _ = write!(head, "Content-Length: {len}\r\n");
            }
            Some(HttpBodyType::Chunked) => head.put_slice(b"Transfer-Encoding: chunked\r\n"),
            Some(HttpBodyType::ReadUntilEnd) => head.put_slice(b"Connection: close\r\n"),
            None => {
                if let Some(len) = rsp.declared_content_length() {
                    let _ = write!(head, "Content-Length: {len}\r\n");
                } else if !(rsp.is_chunked()
                    || rsp.code < 200
                    || rsp.code == 204
                    || rsp.code == 304)
                {
                    head.put_slice(b"Content-Length: 0\r\n");
                }
            }
        }
        head.put_slice(b"\r\n");
        clt_w
            .write_all(&head)
            .await
            .map_err(DispatchError::ClientWriteFailed)?;

        let mut body_bytes = 0u64;
        if let (Some(bt), Some(mut b)) = (body_type, body) {
            match bt {
                HttpBodyType::ContentLength(_) | HttpBodyType::ReadUntilEnd => {
                    if let Some(early) = &early_body {
                        clt_w
                            .write_all(early)
                            .await
                            .map_err(DispatchError::ClientWriteFailed)?;
                        body_bytes += early.len() as u64;
                    }
                    body_bytes += copy_plain(&mut b.reader, clt_w).await?;
                }
                HttpBodyType::Chunked => {
                    body_bytes += copy_chunked(early_body.as_deref(), &mut b.reader, clt_w).await?;
                }
            }
        }
        clt_w
            .flush()
            .await
            .map_err(DispatchError::ClientWriteFailed)?;

        Ok(DispatchOutcome {
            status: rsp.code,
            body_bytes,
            failover_count: 0,
        })
    }

    /// Deliver a response whose body was already buffered during failure
    /// detection; used when retry attempts are exhausted.
    pub(crate) async fn write_back_buffered<W>(
        &self,
        clt_w: &mut W,
        rsp: RemoteResponse,
        body: Bytes,
    ) -> DispatchResult<DispatchOutcome>
    where
        W: AsyncWrite + Unpin,
    {
        let mut head = Vec::<u8>::with_capacity(rsp.origin_header_size() + 256);
        self.emit_status_and_headers(&mut head, &rsp);
        let _ = write!(head, "Content-Length: {}\r\n\r\n", body.len());

        clt_w
            .write_all(&head)
            .await
            .map_err(DispatchError::ClientWriteFailed)?;
        clt_w
            .write_all(&body)
            .await
            .map_err(DispatchError::ClientWriteFailed)?;
        clt_w
            .flush()
            .await
            .map_err(DispatchError::ClientWriteFailed)?;

        Ok(DispatchOutcome {
            status: rsp.code,
            body_bytes: body.len() as u64,
            failover_count: 0,
        })
    }

    fn emit_status_and_headers(&self, buf: &mut Vec<u8>, rsp: &RemoteResponse) {
        let _ = write!(buf, "{:?} {} {}\r\n", rsp.version, rsp.code, rsp.reason);
        for (name, value) in rsp.headers.iter() {
            if self.config.excluded_response_headers.contains(name) {
                continue;
            }
            if *name == header::CONTENT_TYPE {
                if let Some(amended) = amend_content_type(value) {
                    put_header(buf, name, &amended);
                    continue;
                }
            }
            put_header(buf, name, value);
        }
    }
}

fn put_header(buf: &mut Vec<u8>, name: &HeaderName, value: &HeaderValue) {
    buf.put_slice(name.as_ref());
    buf.put_slice(b": ");
    buf.put_slice(value.as_bytes());
    buf.put_slice(b"\r\n");
}

fn parse_target(target: &str) -> DispatchResult<Url> {
    let url =
        Url::parse(target).map_err(|_| DispatchError::InvalidTargetUrl("malformed url"))?;
    if url.scheme() != "http" {
        // TLS termination towards backends belongs to the hosting layer
        return Err(DispatchError::InvalidTargetUrl("unsupported scheme"));
    }
    if url.host_str().is_none() {
        return Err(DispatchError::InvalidTargetUrl("missing host"));
    }
    Ok(url)
}

fn is_unforwardable(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "host"
            | "authorization"
            | "content-length"
            | "transfer-encoding"
            | "connection"
            | "keep-alive"
            | "proxy-connection"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "upgrade"
            | "expect"
    )
}

/// Fill in a default charset for well-known media types when the backend
/// did not specify one; a backend-specified charset is kept as-is.
fn amend_content_type(value: &HeaderValue) -> Option<HeaderValue> {
    let s = value.to_str().ok()?;
    let m = s.parse::<Mime>().ok()?;
    if m.get_param(mime::CHARSET).is_some() {
        return None;
    }
    let charset = default_charset(&m)?;
    HeaderValue::from_str(&format!("{s}; charset={charset}")).ok()
}

fn default_charset(m: &Mime) -> Option<&'static str> {
    match (m.type_().as_str(), m.subtype().as_str()) {
        ("text", "html") | ("text", "plain") => Some("ISO-8859-1"),
        ("application", "json") | ("application", "xml") | ("text", "xml") => Some("UTF-8"),
        _ => None,
    }
}

async fn copy_plain<R, W>(reader: &mut R, writer: &mut W) -> DispatchResult<u64>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; COPY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let nr = reader
            .read(&mut buf)
            .await
            .map_err(DispatchError::RecvFailed)?;
        if nr == 0 {
            return Ok(total);
        }
        writer
            .write_all(&buf[0..nr])
            .await
            .map_err(DispatchError::ClientWriteFailed)?;
        total += nr as u64;
    }
}

async fn copy_chunked<R, W>(
    early_body: Option<&[u8]>,
    reader: &mut R,
    writer: &mut W,
) -> DispatchResult<u64>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut head = Vec::<u8>::with_capacity(16);
    let mut total = 0u64;

    if let Some(data) = early_body {
        if !data.is_empty() {
            let _ = write!(head, "{:x}\r\n", data.len());
            writer
                .write_all(&head)
                .await
                .map_err(DispatchError::ClientWriteFailed)?;
            writer
                .write_all(data)
                .await
                .map_err(DispatchError::ClientWriteFailed)?;
            writer
                .write_all(b"\r\n")
                .await
                .map_err(DispatchError::ClientWriteFailed)?;
            total += data.len() as u64;
        }
    }

    let mut buf = [0u8; COPY_BUF_SIZE];
    loop {
        let nr = reader
            .read(&mut buf)
            .await
            .map_err(DispatchError::RecvFailed)?;
        if nr == 0 {
            writer
                .write_all(b"0\r\n\r\n")
                .await
                .map_err(DispatchError::ClientWriteFailed)?;
            return Ok(total);
        }
        head.clear();
        let _ = write!(head, "{nr:x}\r\n");
        writer
            .write_all(&head)
            .await
            .map_err(DispatchError::ClientWriteFailed)?;
        writer
            .write_all(&buf[0..nr])
            .await
            .map_err(DispatchError::ClientWriteFailed)?;
        writer
            .write_all(b"\r\n")
            .await
            .map_err(DispatchError::ClientWriteFailed)?;
        total += nr as u64;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::registry::StaticBackendRegistry;
    use http::HeaderMap;
    use std::net::SocketAddr;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    pub(crate) async fn spawn_backend(
        response: &'static [u8],
    ) -> (SocketAddr, tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let req = read_http_request(&mut stream).await;
                    let _ = tx.send(req);
                    let _ = stream.write_all(response).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        (addr, rx)
    }

    pub(crate) async fn dead_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    /// Accepts a connection, reads the full request, then closes without
    /// answering.
    pub(crate) async fn spawn_closing_backend()
    -> (SocketAddr, tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let req = read_http_request(&mut stream).await;
                let _ = tx.send(req);
                drop(stream);
            }
        });
        (addr, rx)
    }

    async fn read_http_request(stream: &mut tokio::net::TcpStream) -> Vec<u8> {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        let head_end = loop {
            if let Some(p) = find_head_end(&data) {
                break p;
            }
            let nr = stream.read(&mut buf).await.unwrap_or(0);
            if nr == 0 {
                return data;
            }
            data.extend_from_slice(&buf[0..nr]);
        };
        let content_length = parse_req_content_length(&data[0..head_end]);
        while data.len() < head_end + content_length {
            let nr = stream.read(&mut buf).await.unwrap_or(0);
            if nr == 0 {
                return data;
            }
            data.extend_from_slice(&buf[0..nr]);
        }
        data
    }

    fn find_head_end(data: &[u8]) -> Option<usize> {
        memchr::memmem::find(data, b"\r\n\r\n").map(|p| p + 4)
    }

    fn parse_req_content_length(head: &[u8]) -> usize {
        let text = String::from_utf8_lossy(head).to_lowercase();
        for line in text.lines() {
            if let Some(v) = line.strip_prefix("content-length:") {
                if let Ok(n) = v.trim().parse() {
                    return n;
                }
            }
        }
        0
    }

    fn dispatcher_for(role: &str, registry: Arc<StaticBackendRegistry>) -> Dispatcher {
        Dispatcher::new(
            DispatchConfig::new(role),
            ServerDefaults::default(),
            registry,
        )
    }

    #[tokio::test]
    async fn single_dispatch_roundtrip() {
        let (addr, mut rx) = spawn_backend(
            b"HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: 4\r\n\r\ndata",
        )
        .await;

        let registry = Arc::new(StaticBackendRegistry::new());
        let dispatcher = dispatcher_for("widget", registry);

        let mut headers = HeaderMap::new();
        headers.insert("accept", "application/json".parse().unwrap());
        headers.insert("connection", "keep-alive".parse().unwrap());
        let req = ClientRequest::new(Method::GET, "/data?op=LIST".parse().unwrap(), headers);

        let mut out = Vec::new();
        let outcome = dispatcher
            .do_get(&format!("http://{addr}/data?op=LIST"), req, &mut out)
            .await
            .unwrap();
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.body_bytes, 4);
        assert_eq!(outcome.failover_count, 0);

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.ends_with("\r\n\r\ndata"));

        let sent = String::from_utf8(rx.recv().await.unwrap()).unwrap();
        assert!(sent.starts_with("GET /data?op=LIST HTTP/1.1\r\n"));
        assert!(sent.contains(&format!("Host: {addr}\r\n")));
        assert!(sent.contains("accept: application/json\r\n"));
        // connection handling stays per-hop
        assert!(sent.contains("Connection: close\r\n"));
        assert!(!sent.contains("keep-alive"));
    }

    #[tokio::test]
    async fn response_header_exclusion_and_charset() {
        let (addr, _rx) = spawn_backend(
            b"HTTP/1.1 200 OK\r\n\
              Content-Type: text/html\r\n\
              Set-Cookie: session=secret\r\n\
              WWW-Authenticate: Negotiate\r\n\
              X-Custom: kept\r\n\
              Content-Length: 2\r\n\r\nok",
        )
        .await;

        let registry = Arc::new(StaticBackendRegistry::new());
        let dispatcher = dispatcher_for("widget", registry);
        let req = ClientRequest::new(Method::GET, "/".parse().unwrap(), HeaderMap::new());

        let mut out = Vec::new();
        dispatcher
            .do_get(&format!("http://{addr}/"), req, &mut out)
            .await
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(!text.to_lowercase().contains("set-cookie"));
        assert!(!text.to_lowercase().contains("www-authenticate"));
        assert!(text.contains("x-custom: kept\r\n"));
        assert!(text.contains("content-type: text/html; charset=ISO-8859-1\r\n"));
    }

    #[tokio::test]
    async fn backend_charset_kept_as_is() {
        let (addr, _rx) = spawn_backend(
            b"HTTP/1.1 200 OK\r\n\
              Content-Type: text/html; charset=Shift_JIS\r\n\
              Content-Length: 2\r\n\r\nok",
        )
        .await;

        let registry = Arc::new(StaticBackendRegistry::new());
        let dispatcher = dispatcher_for("widget", registry);
        let req = ClientRequest::new(Method::GET, "/".parse().unwrap(), HeaderMap::new());

        let mut out = Vec::new();
        dispatcher
            .do_get(&format!("http://{addr}/"), req, &mut out)
            .await
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("charset=Shift_JIS"));
        assert!(!text.contains("ISO-8859-1"));
    }

    #[tokio::test]
    async fn chunked_response_reencoded() {
        let (addr, _rx) = spawn_backend(
            b"HTTP/1.1 200 OK\r\n\
              Transfer-Encoding: chunked\r\n\r\n\
              4\r\ndata\r\n3\r\n!!!\r\n0\r\n\r\n",
        )
        .await;

        let registry = Arc::new(StaticBackendRegistry::new());
        let dispatcher = dispatcher_for("widget", registry);
        let req = ClientRequest::new(Method::GET, "/".parse().unwrap(), HeaderMap::new());

        let mut out = Vec::new();
        let outcome = dispatcher
            .do_get(&format!("http://{addr}/"), req, &mut out)
            .await
            .unwrap();
        assert_eq!(outcome.body_bytes, 7);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(text.ends_with("0\r\n\r\n"));
        assert!(text.contains("data"));
        assert!(text.contains("!!!"));
    }

    #[tokio::test]
    async fn post_body_forwarded() {
        let (addr, mut rx) = spawn_backend(
            b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n",
        )
        .await;

        let registry = Arc::new(StaticBackendRegistry::new());
        let dispatcher = dispatcher_for("widget", registry);

        let payload = b"name=widget&size=3";
        let req = ClientRequest::new(Method::POST, "/items".parse().unwrap(), HeaderMap::new())
            .with_body(
                Box::new(std::io::Cursor::new(&payload[..])),
                BodyTransfer::Sized(payload.len() as u64),
            );

        let mut out = Vec::new();
        let outcome = dispatcher
            .do_post(&format!("http://{addr}/items"), req, &mut out)
            .await
            .unwrap();
        assert_eq!(outcome.status, 201);

        let sent = rx.recv().await.unwrap();
        let text = String::from_utf8(sent).unwrap();
        assert!(text.contains(&format!("Content-Length: {}\r\n", payload.len())));
        assert!(text.ends_with("name=widget&size=3"));
    }

    #[tokio::test]
    async fn credentials_skipped_with_delegation_token() {
        struct BasicCreds;
        impl CredentialProvider for BasicCreds {
            fn inject(&self, outbound: &mut OutboundRequest) -> anyhow::Result<()> {
                outbound
                    .headers_mut()
                    .insert(header::AUTHORIZATION, "Basic Z3c6Z3c=".parse()?);
                Ok(())
            }
        }

        let (addr, mut rx) =
            spawn_backend(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
        let registry = Arc::new(StaticBackendRegistry::new());
        let dispatcher = dispatcher_for("widget", registry).with_credential_provider(Arc::new(BasicCreds));

        let req = ClientRequest::new(Method::GET, "/".parse().unwrap(), HeaderMap::new());
        let mut out = Vec::new();
        dispatcher
            .do_get(&format!("http://{addr}/data"), req, &mut out)
            .await
            .unwrap();
        let sent = String::from_utf8(rx.recv().await.unwrap()).unwrap();
        assert!(sent.contains("authorization: Basic"));

        let req = ClientRequest::new(Method::GET, "/".parse().unwrap(), HeaderMap::new());
        let mut out = Vec::new();
        dispatcher
            .do_get(&format!("http://{addr}/data?delegation=tok123"), req, &mut out)
            .await
            .unwrap();
        let sent = String::from_utf8(rx.recv().await.unwrap()).unwrap();
        assert!(!sent.to_lowercase().contains("authorization:"));
    }

    #[tokio::test]
    async fn malformed_target_is_distinct() {
        let registry = Arc::new(StaticBackendRegistry::new());
        let dispatcher = dispatcher_for("widget", registry);
        let req = ClientRequest::new(Method::GET, "/".parse().unwrap(), HeaderMap::new());
        let mut out = Vec::new();
        let err = dispatcher
            .do_get("not a url", req, &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidTargetUrl(_)));

        let req = ClientRequest::new(Method::GET, "/".parse().unwrap(), HeaderMap::new());
        let err = dispatcher
            .do_get("https://secure.example.com/", req, &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidTargetUrl(_)));
    }

    #[tokio::test]
    async fn connect_failure_is_sanitized() {
        let addr = dead_backend().await;
        let registry = Arc::new(StaticBackendRegistry::new());
        let dispatcher = dispatcher_for("widget", registry);
        let req = ClientRequest::new(Method::GET, "/".parse().unwrap(), HeaderMap::new());
        let mut out = Vec::new();
        let err = dispatcher
            .do_get(&format!("http://{addr}/"), req, &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ConnectFailed(_)));
        let msg = format!("{err}");
        assert!(!msg.contains("127.0.0.1"));
        assert!(!msg.contains(&addr.port().to_string()));
    }
}
