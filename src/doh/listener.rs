// src/doh/listener.rs
//
// 安全监听器：接受 QUIC 连接、完成握手并为每个连接启动会话

use crate::doh::handlers::DohHandler;
use crate::doh::session::{self, Session, SessionState};
use crate::error::AppError;
use crate::metrics::METRICS;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 接受循环，直到收到停止信号或端点关闭
pub async fn accept_loop(
    endpoint: quinn::Endpoint,
    handler: Arc<DohHandler>,
    shutdown: CancellationToken,
) {
    info!(
        "DoH frontend accepting connections on {:?}",
        endpoint.local_addr().ok()
    );

    loop {
        let incoming = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Listener received stop signal");
                break;
            }
            incoming = endpoint.accept() => match incoming {
                Some(incoming) => incoming,
                None => {
                    debug!("Endpoint closed, listener exiting");
                    break;
                }
            },
        };

        let handler = Arc::clone(&handler);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            handle_incoming(incoming, handler, shutdown).await;
        });
    }
}

// 完成握手后登记会话并开始服务；握手失败的连接不产生会话
async fn handle_incoming(
    incoming: quinn::Incoming,
    handler: Arc<DohHandler>,
    shutdown: CancellationToken,
) {
    let state = handler.state().clone();
    let remote_addr = incoming.remote_address();

    // 会话参数在创建时确定
    let session = state.sessions.create(remote_addr, state.limits());
    debug!("Session {} handshaking with {}", session.id(), remote_addr);

    let connecting = match incoming.accept() {
        Ok(connecting) => connecting,
        Err(e) => {
            handshake_failed(&session, remote_addr, e);
            return;
        }
    };

    let connection = tokio::select! {
        _ = shutdown.cancelled() => {
            session.transition(SessionState::Closed);
            return;
        }
        result = connecting => match result {
            Ok(connection) => connection,
            Err(e) => {
                handshake_failed(&session, remote_addr, e);
                return;
            }
        },
    };

    state.stats.record_connection();
    METRICS.connections_total().inc();

    session.transition(SessionState::Established);
    state.sessions.register(Arc::clone(&session));

    info!("Session {} established with {}", session.id(), remote_addr);

    session::serve(session, connection, handler, shutdown).await;
}

// 握手失败：记录并关闭未登记的会话
fn handshake_failed(session: &Session, remote_addr: SocketAddr, reason: impl Display) {
    let err = AppError::HandshakeFailure(format!("{}: {}", remote_addr, reason));
    warn!("Session {}: {}", session.id(), err);
    METRICS.handshake_failures_total().inc();
    session.transition(SessionState::Closed);
}
