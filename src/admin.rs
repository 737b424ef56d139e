// src/admin.rs

use crate::doh::session::SessionInfo;
use crate::error::AppError;
use crate::frontend::DohFrontend;
use crate::metrics;
use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_graceful_shutdown::SubsystemHandle;
use tracing::{error, info};

// 管理服务器
pub struct AdminServer {
    // 监听地址
    listen_addr: SocketAddr,
    // 被管理的前端
    frontend: Arc<DohFrontend>,
}

/// 统计接口返回内容
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatsResponse {
    pub queries_received: u64,
    pub connections_accepted: u64,
    pub running: bool,
    pub active_sessions: usize,
    pub send_blocked: bool,
}

// 清零参数，默认只清零查询计数
#[derive(Debug, Default, Deserialize)]
pub struct ClearParams {
    #[serde(default)]
    pub connections: bool,
}

impl AdminServer {
    // 创建新的管理服务器
    pub fn new(listen_addr: SocketAddr, frontend: Arc<DohFrontend>) -> Self {
        Self {
            listen_addr,
            frontend,
        }
    }

    // 组合健康检查、指标与统计路由
    pub fn router(frontend: Arc<DohFrontend>) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/stats", get(stats_handler))
            .route("/stats/clear", post(clear_stats_handler))
            .route("/sessions", get(sessions_handler))
            .merge(metrics::metrics_routes())
            .with_state(frontend)
    }

    // 启动管理服务器，直到收到关闭信号
    async fn serve(
        listen_addr: SocketAddr,
        app: Router,
        shutdown_rx: oneshot::Receiver<()>,
    ) -> Result<(), AppError> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Admin server listening on {}", listen_addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
                info!("Admin server received shutdown signal");
            })
            .await?;

        Ok(())
    }

    // 运行服务器（用于优雅关闭集成）
    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), AppError> {
        let app = Self::router(Arc::clone(&self.frontend));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let server = Self::serve(self.listen_addr, app, shutdown_rx);
        tokio::pin!(server);

        tokio::select! {
            res = &mut server => {
                if let Err(err) = res {
                    error!("Admin server error: {}", err);
                    Err(err)
                } else {
                    info!("Admin server stopped");
                    Ok(())
                }
            }
            _ = subsys.on_shutdown_requested() => {
                info!("Received subsystem shutdown request, admin server is stopping");
                let _ = shutdown_tx.send(());
                server.await
            }
        }
    }
}

// 健康检查处理程序
async fn health_handler() -> &'static str {
    "OK"
}

fn stats_response(frontend: &DohFrontend) -> StatsResponse {
    let stats = frontend.stats();
    StatsResponse {
        queries_received: stats.queries_received,
        connections_accepted: stats.connections_accepted,
        running: frontend.is_running(),
        active_sessions: frontend.session_count(),
        send_blocked: frontend.is_sending_blocked(),
    }
}

async fn stats_handler(State(frontend): State<Arc<DohFrontend>>) -> Json<StatsResponse> {
    Json(stats_response(&frontend))
}

async fn clear_stats_handler(
    State(frontend): State<Arc<DohFrontend>>,
    Query(params): Query<ClearParams>,
) -> Json<StatsResponse> {
    frontend.clear_queries();
    if params.connections {
        frontend.clear_connections();
    }
    info!(
        "Statistics cleared (connections included: {})",
        params.connections
    );
    Json(stats_response(&frontend))
}

async fn sessions_handler(State(frontend): State<Arc<DohFrontend>>) -> Json<Vec<SessionInfo>> {
    Json(frontend.sessions())
}
