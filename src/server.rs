// src/server.rs

use crate::error::AppError;
use crate::frontend::DohFrontend;
use std::sync::Arc;
use tokio_graceful_shutdown::SubsystemHandle;
use tracing::{error, info};

/// 前端子系统
///
/// 在优雅关闭框架中启动 DoH 前端，收到关闭请求后停止。
pub struct FrontendService {
    frontend: Arc<DohFrontend>,
}

impl FrontendService {
    pub fn new(frontend: Arc<DohFrontend>) -> Self {
        Self { frontend }
    }

    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), AppError> {
        if let Err(e) = self.frontend.start() {
            error!("Failed to start DoH frontend: {}", e);
            return Err(e);
        }

        if let Some(addr) = self.frontend.local_addr() {
            info!(
                "DoH frontend serving https://{}/dns-query over HTTP/3",
                addr
            );
        }

        subsys.on_shutdown_requested().await;
        info!("Shutdown requested, stopping DoH frontend");

        self.frontend.stop();
        Ok(())
    }
}
