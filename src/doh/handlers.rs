// src/doh/handlers.rs

use crate::doh::session::{Session, StreamGuard};
use crate::doh::state::AppState;
use crate::error::AppError;
use crate::metrics::METRICS;
use crate::r#const::{doh_protocol, error_labels, http_headers, method_labels};
use crate::upstream::BackendRelay;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use h3::server::RequestStream;
use hickory_proto::op::{Message, MessageType};
use http::{header, Method, Request, Response, StatusCode};
use std::time::Instant;
use tracing::{debug, error, warn};

/// 服务端 HTTP/3 请求流
pub type H3Stream = RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>;

/// 流的解码阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    HeaderPending,
    BodyPending,
    Complete,
}

/// RFC 8484 定义的两种交换方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangePattern {
    Get,
    Post,
}

impl ExchangePattern {
    fn label(self) -> &'static str {
        match self {
            Self::Get => method_labels::GET,
            Self::Post => method_labels::POST,
        }
    }
}

/// 单个请求流上的解码状态
///
/// 累计的未解码字节数不得超过会话创建时的缓冲上限。
#[derive(Debug)]
pub struct StreamExchange {
    id: u64,
    limit: usize,
    received: usize,
    buffer: BytesMut,
    state: DecodeState,
}

impl StreamExchange {
    pub fn new(id: u64, limit: usize) -> Self {
        Self {
            id,
            limit,
            received: 0,
            buffer: BytesMut::new(),
            state: DecodeState::HeaderPending,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    // 计入未解码字节，超限时整个流失败
    fn account(&mut self, len: usize) -> Result<(), AppError> {
        self.received = self.received.saturating_add(len);
        if self.received > self.limit {
            return Err(AppError::BufferOverflow {
                received: self.received,
                limit: self.limit,
            });
        }
        Ok(())
    }

    /// 解析请求头，GET 请求在此完成全部解码
    pub fn decode_head(&mut self, request: &Request<()>) -> Result<ExchangePattern, StatusCode> {
        if request.uri().path() != doh_protocol::QUERY_PATH {
            debug!("Unknown DoH path: {}", request.uri().path());
            return Err(StatusCode::NOT_FOUND);
        }

        match request.method() {
            &Method::GET => {
                // 提取 DNS 查询参数
                let param = request
                    .uri()
                    .query()
                    .and_then(find_dns_param)
                    .ok_or_else(|| {
                        warn!("Missing 'dns' parameter in DoH GET request");
                        StatusCode::BAD_REQUEST
                    })?;

                self.account(param.len()).map_err(|e| {
                    warn!("Stream {}: {}", self.id, e);
                    StatusCode::PAYLOAD_TOO_LARGE
                })?;

                // 解码 base64url DNS 消息，容忍末尾填充
                let dns_bytes = URL_SAFE_NO_PAD
                    .decode(param.trim_end_matches('='))
                    .map_err(|e| {
                        warn!("Failed to decode DNS message: {}", e);
                        StatusCode::BAD_REQUEST
                    })?;

                self.buffer.put_slice(&dns_bytes);
                self.state = DecodeState::Complete;
                Ok(ExchangePattern::Get)
            }
            &Method::POST => {
                // 验证内容类型
                let content_type = request.headers().get(header::CONTENT_TYPE).ok_or_else(|| {
                    warn!("Missing content type header");
                    StatusCode::BAD_REQUEST
                })?;

                if !is_dns_message(content_type) {
                    warn!("Invalid content type: {:?}", content_type);
                    return Err(StatusCode::UNSUPPORTED_MEDIA_TYPE);
                }

                self.state = DecodeState::BodyPending;
                Ok(ExchangePattern::Post)
            }
            other => {
                debug!("Unsupported DoH method: {}", other);
                Err(StatusCode::METHOD_NOT_ALLOWED)
            }
        }
    }

    /// 追加请求体数据
    pub fn push_body<B: Buf>(&mut self, chunk: B) -> Result<(), AppError> {
        self.account(chunk.remaining())?;
        self.buffer.put(chunk);
        Ok(())
    }

    /// 请求体接收完毕
    pub fn finish_body(&mut self) {
        self.state = DecodeState::Complete;
    }

    /// 将已接收的字节解析为 DNS 查询
    pub fn decode_message(&self) -> Result<Message, StatusCode> {
        if self.state != DecodeState::Complete {
            return Err(StatusCode::BAD_REQUEST);
        }

        let message = Message::from_vec(&self.buffer).map_err(|e| {
            warn!("Failed to parse DNS message: {}", e);
            StatusCode::BAD_REQUEST
        })?;

        if message.message_type() != MessageType::Query {
            warn!("DoH payload is not a DNS query");
            return Err(StatusCode::BAD_REQUEST);
        }

        if message.queries().is_empty() {
            warn!("DoH payload carries no question");
            return Err(StatusCode::BAD_REQUEST);
        }

        Ok(message)
    }

    pub fn into_payload(self) -> Bytes {
        self.buffer.freeze()
    }
}

// 查找查询串中的 dns 参数
fn find_dns_param(query: &str) -> Option<&str> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == doh_protocol::DNS_PARAM && !value.is_empty()).then_some(value)
    })
}

// 内容类型允许携带参数，例如 charset
fn is_dns_message(value: &header::HeaderValue) -> bool {
    value
        .to_str()
        .ok()
        .and_then(|v| v.split(';').next())
        .map(|v| {
            v.trim()
                .eq_ignore_ascii_case(http_headers::content_types::DNS_MESSAGE)
        })
        .unwrap_or(false)
}

// 状态码对应的流错误标签
fn error_label(status: StatusCode) -> &'static str {
    match status {
        StatusCode::NOT_FOUND => error_labels::NOT_FOUND,
        StatusCode::METHOD_NOT_ALLOWED => error_labels::METHOD_NOT_ALLOWED,
        StatusCode::PAYLOAD_TOO_LARGE => error_labels::BUFFER_OVERFLOW,
        StatusCode::UNSUPPORTED_MEDIA_TYPE => error_labels::UNSUPPORTED_MEDIA_TYPE,
        StatusCode::BAD_GATEWAY => error_labels::BACKEND_UNAVAILABLE,
        StatusCode::SERVICE_UNAVAILABLE => error_labels::STREAM_LIMIT,
        _ => error_labels::BAD_REQUEST,
    }
}

/// DoH 请求处理器
///
/// 每个请求流严格按 解码 -> 转发 -> 编码 的顺序处理。
pub struct DohHandler {
    state: AppState,
    relay: BackendRelay,
}

impl DohHandler {
    pub fn new(state: AppState, relay: BackendRelay) -> Self {
        Self { state, relay }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// 处理一个请求流
    pub async fn handle_stream(&self, request: Request<()>, mut stream: H3Stream, guard: &StreamGuard) {
        let session = guard.session();
        let mut exchange =
            StreamExchange::new(guard.id(), session.limits().max_buffer_size as usize);

        debug!(
            "Session {} stream {}: {} {}",
            session.id(),
            exchange.id(),
            request.method(),
            request.uri()
        );

        let pattern = match self.read_query(&request, &mut stream, &mut exchange, session).await {
            Ok(pattern) => pattern,
            Err(status) => {
                self.send_error(&mut stream, status).await;
                return;
            }
        };

        // 记录请求开始时间
        let start_time = Instant::now();
        let payload = exchange.into_payload();

        // 后端等待时间可在运行中调整，每个请求读取一次
        let relay = self.relay.with_timeout(self.state.backend_timeout());
        let answer = match relay.relay(&payload).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Session {} backend relay failed: {}", session.id(), e);
                self.send_error(&mut stream, StatusCode::BAD_GATEWAY).await;
                return;
            }
        };

        session.touch();

        let response = match Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, http_headers::content_types::DNS_MESSAGE)
            .header(header::CONTENT_LENGTH, answer.len())
            .body(())
        {
            Ok(response) => response,
            Err(e) => {
                error!("Failed to build DoH response: {}", e);
                return;
            }
        };

        if let Err(e) = self.write_response(&mut stream, response, Some(answer)).await {
            warn!("Session {} failed to send DoH response: {}", session.id(), e);
            METRICS
                .stream_errors_total()
                .with_label_values(&[error_labels::SEND_ERROR])
                .inc();
            return;
        }

        // 记录处理时间
        let duration = start_time.elapsed();
        METRICS
            .dns_request_duration_seconds()
            .with_label_values(&[pattern.label()])
            .observe(duration.as_secs_f64());

        debug!(
            "Session {} stream {} answered in {:?}",
            session.id(),
            guard.id(),
            duration
        );
    }

    // 读取并解码查询，成功时查询计数加一
    async fn read_query(
        &self,
        request: &Request<()>,
        stream: &mut H3Stream,
        exchange: &mut StreamExchange,
        session: &Session,
    ) -> Result<ExchangePattern, StatusCode> {
        let pattern = exchange.decode_head(request)?;

        if exchange.state() == DecodeState::BodyPending {
            loop {
                match stream.recv_data().await {
                    Ok(Some(chunk)) => {
                        session.touch();
                        exchange.push_body(chunk).map_err(|e| {
                            warn!("Session {} stream {}: {}", session.id(), exchange.id(), e);
                            StatusCode::PAYLOAD_TOO_LARGE
                        })?;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Session {} failed to read request body: {}", session.id(), e);
                        return Err(StatusCode::BAD_REQUEST);
                    }
                }
            }
            exchange.finish_body();
        }

        let message = exchange.decode_message()?;

        self.state.stats.record_query();
        METRICS
            .dns_queries_total()
            .with_label_values(&[pattern.label()])
            .inc();

        if let Some(query) = message.queries().first() {
            debug!(
                "Decoded DNS query: {} {} (id {})",
                query.name(),
                query.query_type(),
                message.id()
            );
        }

        Ok(pattern)
    }

    /// 超出并发流上限时拒绝请求
    pub async fn reject_stream(&self, mut stream: H3Stream) {
        self.send_error(&mut stream, StatusCode::SERVICE_UNAVAILABLE).await;
    }

    // 发送错误状态并结束流
    async fn send_error(&self, stream: &mut H3Stream, status: StatusCode) {
        METRICS
            .stream_errors_total()
            .with_label_values(&[error_label(status)])
            .inc();

        let response = match Response::builder()
            .status(status)
            .header(header::CONTENT_LENGTH, 0)
            .body(())
        {
            Ok(response) => response,
            Err(e) => {
                error!("Failed to build error response: {}", e);
                return;
            }
        };

        if let Err(e) = self.write_response(stream, response, None).await {
            debug!("Failed to send error response {}: {}", status, e);
        }
    }

    // 每次写入前都检查发送阻断开关
    async fn write_response(
        &self,
        stream: &mut H3Stream,
        response: Response<()>,
        body: Option<Bytes>,
    ) -> Result<(), AppError> {
        let gate = &self.state.send_gate;

        gate.wait_open().await;
        stream.send_response(response).await?;

        if let Some(body) = body {
            gate.wait_open().await;
            stream.send_data(body).await?;
        }

        gate.wait_open().await;
        stream.finish().await?;

        Ok(())
    }
}
