// src/doh/session.rs
//
// 会话状态机：每个 QUIC 连接对应一个会话，
// 状态只能单向推进 Handshaking -> Established -> Closing -> Closed。

use crate::doh::handlers::DohHandler;
use crate::doh::state::SessionLimits;
use crate::error::AppError;
use crate::metrics::METRICS;
use crate::r#const::{close_labels, doh_protocol, error_labels};
use bytes::Bytes;
use dashmap::DashMap;
use h3::error::ErrorLevel;
use quinn::{ConnectionError, VarInt};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[repr(u8)]
pub enum SessionState {
    Handshaking = 0,
    Established = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Handshaking,
            1 => Self::Established,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// 会话快照，供控制面查询
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: u64,
    pub remote_addr: SocketAddr,
    pub state: SessionState,
    pub open_streams: u64,
    pub idle_ms: u64,
}

/// 一个安全传输连接
#[derive(Debug)]
pub struct Session {
    id: u64,
    remote_addr: SocketAddr,
    // 会话创建时读取的参数，之后的配置修改不影响本会话
    limits: SessionLimits,
    state: AtomicU8,
    open_streams: AtomicU64,
    next_stream_id: AtomicU64,
    last_activity: Mutex<Instant>,
}

impl Session {
    pub fn new(id: u64, remote_addr: SocketAddr, limits: SessionLimits) -> Self {
        Self {
            id,
            remote_addr,
            limits,
            state: AtomicU8::new(SessionState::Handshaking as u8),
            open_streams: AtomicU64::new(0),
            next_stream_id: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// 推进会话状态，只允许向后迁移；返回是否发生了迁移
    pub fn transition(&self, next: SessionState) -> bool {
        let result = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if (next as u8) > current {
                    Some(next as u8)
                } else {
                    None
                }
            });

        match result {
            Ok(previous) => {
                debug!(
                    "Session {} state {:?} -> {:?}",
                    self.id,
                    SessionState::from_u8(previous),
                    next
                );
                true
            }
            Err(_) => false,
        }
    }

    pub fn open_streams(&self) -> u64 {
        self.open_streams.load(Ordering::Acquire)
    }

    // 刷新最近活动时间
    pub fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    pub fn idle_for(&self) -> Duration {
        match self.last_activity.lock() {
            Ok(last) => last.elapsed(),
            Err(poisoned) => poisoned.into_inner().elapsed(),
        }
    }

    /// 为新的请求流占用一个并发名额
    pub fn open_stream(self: &Arc<Self>) -> Result<StreamGuard, AppError> {
        if self.state() != SessionState::Established {
            return Err(AppError::Internal(format!(
                "session {} is not established",
                self.id
            )));
        }

        let limit = self.limits.max_streams_bidi;
        self.open_streams
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                if open < limit {
                    Some(open + 1)
                } else {
                    None
                }
            })
            .map_err(|_| AppError::StreamLimitExceeded(limit))?;

        self.touch();
        Ok(StreamGuard {
            session: Arc::clone(self),
            id: self.next_stream_id.fetch_add(1, Ordering::Relaxed),
        })
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            remote_addr: self.remote_addr,
            state: self.state(),
            open_streams: self.open_streams(),
            idle_ms: self.idle_for().as_millis() as u64,
        }
    }
}

/// 请求流占用的并发名额，释放时归还
#[derive(Debug)]
pub struct StreamGuard {
    session: Arc<Session>,
    id: u64,
}

impl StreamGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.session.open_streams.fetch_sub(1, Ordering::AcqRel);
        self.session.touch();
    }
}

/// 活跃会话表
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<u64, Arc<Session>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // 分配会话 ID 并创建处于握手阶段的会话（尚未登记）
    pub fn create(&self, remote_addr: SocketAddr, limits: SessionLimits) -> Arc<Session> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Arc::new(Session::new(id, remote_addr, limits))
    }

    pub fn register(&self, session: Arc<Session>) {
        self.sessions.insert(session.id(), session);
        METRICS.active_sessions().inc();
    }

    pub fn remove(&self, id: u64) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(&id).map(|(_, session)| session);
        if removed.is_some() {
            METRICS.active_sessions().dec();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.sessions.iter().map(|entry| entry.value().info()).collect();
        sessions.sort_by_key(|info| info.id);
        sessions
    }

    // 停止时强制关闭全部会话
    pub fn close_all(&self) {
        let ids: Vec<u64> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some(session) = self.remove(id) {
                session.transition(SessionState::Closing);
                session.transition(SessionState::Closed);
            }
        }
    }
}

// 根据 QUIC 关闭原因选择指标标签
fn close_label(reason: Option<ConnectionError>) -> &'static str {
    match reason {
        Some(ConnectionError::TimedOut) => close_labels::IDLE_TIMEOUT,
        Some(ConnectionError::ApplicationClosed(_)) | Some(ConnectionError::ConnectionClosed(_)) => {
            close_labels::PEER_CLOSED
        }
        Some(ConnectionError::LocallyClosed) => close_labels::STOPPED,
        _ => close_labels::PROTOCOL_ERROR,
    }
}

/// 服务一个已建立的会话，直到连接关闭或收到停止信号
pub async fn serve(
    session: Arc<Session>,
    connection: quinn::Connection,
    handler: Arc<DohHandler>,
    shutdown: CancellationToken,
) {
    let streams = shutdown.child_token();

    let reason = tokio::select! {
        _ = shutdown.cancelled() => {
            connection.close(VarInt::from_u32(0), doh_protocol::CLOSE_REASON_STOPPED);
            close_labels::STOPPED
        }
        reason = accept_requests(&session, connection.clone(), &handler, &streams) => reason,
    };

    // 进入关闭阶段并释放全部请求流
    session.transition(SessionState::Closing);
    streams.cancel();
    connection.close(VarInt::from_u32(0), doh_protocol::CLOSE_REASON_SESSION);
    session.transition(SessionState::Closed);

    handler.state().sessions.remove(session.id());
    METRICS.session_closes_total().with_label_values(&[reason]).inc();

    info!(
        "Session {} from {} closed ({})",
        session.id(),
        session.remote_addr(),
        reason
    );
}

// 接收请求流并为每个流派生独立任务
async fn accept_requests(
    session: &Arc<Session>,
    connection: quinn::Connection,
    handler: &Arc<DohHandler>,
    streams: &CancellationToken,
) -> &'static str {
    let mut h3_conn: h3::server::Connection<h3_quinn::Connection, Bytes> =
        match h3::server::Connection::new(h3_quinn::Connection::new(connection.clone())).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Session {} failed to set up HTTP/3: {}", session.id(), e);
                return close_label(connection.close_reason());
            }
        };

    loop {
        match h3_conn.accept().await {
            Ok(Some((request, stream))) => {
                session.touch();

                let guard = match session.open_stream() {
                    Ok(guard) => guard,
                    Err(e) => {
                        warn!("Session {} rejected stream: {}", session.id(), e);
                        METRICS
                            .stream_errors_total()
                            .with_label_values(&[error_labels::STREAM_LIMIT])
                            .inc();
                        let handler = Arc::clone(handler);
                        let token = streams.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = token.cancelled() => {}
                                _ = handler.reject_stream(stream) => {}
                            }
                        });
                        continue;
                    }
                };

                let handler = Arc::clone(handler);
                let token = streams.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {
                            debug!(
                                "Stream {} of session {} cancelled",
                                guard.id(),
                                guard.session().id()
                            );
                        }
                        _ = handler.handle_stream(request, stream, &guard) => {}
                    }
                });
            }
            Ok(None) => {
                debug!("Session {} received GOAWAY", session.id());
                return close_label(connection.close_reason());
            }
            Err(e) => match e.get_error_level() {
                ErrorLevel::ConnectionError => {
                    debug!("Session {} connection error: {}", session.id(), e);
                    return close_label(connection.close_reason());
                }
                ErrorLevel::StreamError => {
                    debug!("Session {} stream error: {}", session.id(), e);
                    continue;
                }
            },
        }
    }
}
