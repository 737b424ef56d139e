// src/frontend.rs
//
// 生命周期控制器：创建、配置、启动与停止 DoH 前端

use crate::doh::handlers::DohHandler;
use crate::doh::listener;
use crate::doh::session::SessionInfo;
use crate::doh::state::{AppState, RuntimeConfig, SessionLimits, StatsSnapshot};
use crate::doh::tls;
use crate::error::{AppError, ConfigError};
use crate::r#const::{backend_limits, doh_protocol, server_defaults, session_limits};
use crate::upstream::BackendRelay;
use quinn::VarInt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// 运行中的服务器资源
struct RunningServer {
    endpoint: quinn::Endpoint,
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
    local_addr: SocketAddr,
}

enum Lifecycle {
    Idle,
    Running(RunningServer),
}

/// DoH 前端句柄
///
/// 句柄拥有独立的 tokio 运行时，所有控制接口均为同步调用，
/// 可以在任意线程（包括其他运行时内部）使用。
/// 生命周期切换与配置修改在同一把互斥锁内串行执行，临界区内不等待任何异步操作；
/// `stop` 只在锁内同步等待自有运行时上的释放任务完成。
pub struct DohFrontend {
    runtime: Option<Runtime>,
    state: AppState,
    lifecycle: Mutex<Lifecycle>,
}

impl DohFrontend {
    /// 创建前端句柄
    ///
    /// 地址与端口在此处解析，失败时返回 [`ConfigError`]。
    pub fn new(
        listen_addr: &str,
        listen_service: &str,
        backend_addr: &str,
        backend_service: &str,
    ) -> Result<Self, AppError> {
        let listen = resolve_socket_addr(listen_addr, listen_service).ok_or_else(|| {
            ConfigError::InvalidListenAddress(format!("{}:{}", listen_addr, listen_service))
        })?;
        let backend = resolve_socket_addr(backend_addr, backend_service).ok_or_else(|| {
            ConfigError::InvalidBackendAddress(format!("{}:{}", backend_addr, backend_service))
        })?;

        Self::with_config(RuntimeConfig::new(listen, backend))
    }

    /// 使用完整配置创建前端句柄
    pub fn with_config(config: RuntimeConfig) -> Result<Self, AppError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(server_defaults::RUNTIME_WORKER_THREADS)
            .thread_name(server_defaults::RUNTIME_THREAD_NAME)
            .enable_all()
            .build()?;

        debug!(
            "Created DoH frontend for {} (backend {})",
            config.listen_addr, config.backend_addr
        );

        Ok(Self {
            runtime: Some(runtime),
            state: AppState::new(config),
            lifecycle: Mutex::new(Lifecycle::Idle),
        })
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        match self.lifecycle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_certificate(&self, pem: &str) {
        let _lifecycle = self.lock_lifecycle();
        self.state
            .update_config(|config| config.certificate = Some(pem.to_string()));
    }

    pub fn set_private_key(&self, pem: &str) {
        let _lifecycle = self.lock_lifecycle();
        self.state
            .update_config(|config| config.private_key = Some(pem.to_string()));
    }

    /// 启动前端
    ///
    /// 证书或私钥无效时返回 [`AppError::TlsConfig`]，句柄保持可启动状态。
    pub fn start(&self) -> Result<(), AppError> {
        let mut lifecycle = self.lock_lifecycle();
        if matches!(*lifecycle, Lifecycle::Running(_)) {
            return Err(AppError::AlreadyRunning);
        }

        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| AppError::Internal("runtime has been shut down".to_string()))?;

        let config = self.state.config_snapshot();
        let server_config = tls::build_server_config(
            config.certificate.as_deref(),
            config.private_key.as_deref(),
            &config.limits,
        )?;

        // 端点驱动需要在运行时上下文中创建
        let _enter = runtime.enter();
        let socket = UdpSocket::bind(config.listen_addr)?;
        let endpoint = quinn::Endpoint::new(
            tls::build_endpoint_config()?,
            Some(server_config),
            socket,
            Arc::new(quinn::TokioRuntime),
        )?;
        let local_addr = endpoint.local_addr()?;

        let relay = BackendRelay::new(config.backend_addr, config.backend_timeout);
        let handler = Arc::new(DohHandler::new(self.state.clone(), relay));
        let shutdown = CancellationToken::new();

        let accept_task = runtime.spawn(listener::accept_loop(
            endpoint.clone(),
            handler,
            shutdown.clone(),
        ));

        info!(
            "DoH frontend started on {} relaying to {}",
            local_addr, config.backend_addr
        );

        *lifecycle = Lifecycle::Running(RunningServer {
            endpoint,
            shutdown,
            accept_task,
            local_addr,
        });

        Ok(())
    }

    /// 停止前端；未运行时返回 false
    ///
    /// 关闭端点并立即取消所有会话、后端等待与流读写，不做优雅排空。
    /// 返回前等待监听套接字释放（有上限），随后可在同一地址重新启动。
    pub fn stop(&self) -> bool {
        let mut lifecycle = self.lock_lifecycle();
        let running = match std::mem::replace(&mut *lifecycle, Lifecycle::Idle) {
            Lifecycle::Idle => return false,
            Lifecycle::Running(running) => running,
        };

        let RunningServer {
            endpoint,
            shutdown,
            accept_task,
            local_addr,
        } = running;

        shutdown.cancel();
        endpoint.close(VarInt::from_u32(0), doh_protocol::CLOSE_REASON_STOPPED);
        accept_task.abort();
        self.state.sessions.close_all();

        let timeout = Duration::from_millis(server_defaults::STOP_RELEASE_TIMEOUT_MS);
        match &self.runtime {
            Some(runtime) => {
                let (done_tx, done_rx) = mpsc::channel();
                runtime.spawn(async move {
                    let release = release_endpoint(endpoint, accept_task, local_addr);
                    let released = tokio::time::timeout(timeout, release).await.is_ok();
                    let _ = done_tx.send(released);
                });

                // 不依赖调用方的运行时，异步上下文中同样可用
                match done_rx.recv_timeout(timeout + Duration::from_millis(500)) {
                    Ok(true) => debug!("Listening socket {} released", local_addr),
                    _ => warn!(
                        "Listening socket {} was not released within {:?}",
                        local_addr, timeout
                    ),
                }
            }
            None => drop(endpoint),
        }

        info!("DoH frontend on {} stopped", local_addr);
        true
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lock_lifecycle(), Lifecycle::Running(_))
    }

    /// 运行中的实际监听地址，监听端口为 0 时使用
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.lock_lifecycle() {
            Lifecycle::Running(running) => Some(running.local_addr),
            Lifecycle::Idle => None,
        }
    }

    pub fn backend_addr(&self) -> SocketAddr {
        self.state.config_snapshot().backend_addr
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.state.stats.snapshot()
    }

    pub fn clear_queries(&self) {
        self.state.stats.clear_queries();
    }

    pub fn clear_connections(&self) {
        self.state.stats.clear_connections();
    }

    /// 设置空闲超时（毫秒），0 表示关闭；只影响之后建立的会话
    pub fn set_max_idle_timeout(&self, millis: u64) {
        let millis = if millis > session_limits::MAX_IDLE_TIMEOUT_MS {
            warn!(
                "Idle timeout {}ms exceeds limit, using {}ms",
                millis,
                session_limits::MAX_IDLE_TIMEOUT_MS
            );
            session_limits::MAX_IDLE_TIMEOUT_MS
        } else {
            millis
        };
        self.update_limits(|limits| limits.max_idle_timeout = millis);
    }

    /// 设置单流缓冲上限（字节）；只影响之后建立的会话
    pub fn set_max_buffer_size(&self, bytes: u64) {
        let bytes = bytes.clamp(
            session_limits::MIN_MAX_BUFFER_SIZE,
            session_limits::MAX_MAX_BUFFER_SIZE,
        );
        self.update_limits(|limits| limits.max_buffer_size = bytes);
    }

    /// 设置并发双向流上限；只影响之后建立的会话
    pub fn set_max_streams_bidi(&self, count: u64) {
        let count = count.min(session_limits::MAX_MAX_STREAMS_BIDI);
        self.update_limits(|limits| limits.max_streams_bidi = count);
    }

    /// 设置后端等待时间；对之后的请求立即生效
    pub fn set_backend_timeout(&self, timeout: Duration) {
        let timeout = timeout.clamp(
            Duration::from_secs(backend_limits::MIN_TIMEOUT),
            Duration::from_secs(backend_limits::MAX_TIMEOUT),
        );
        let _lifecycle = self.lock_lifecycle();
        self.state
            .update_config(|config| config.backend_timeout = timeout);
    }

    /// 阻断或恢复所有出站写入，立即生效
    pub fn block_sending(&self, blocked: bool) {
        debug!("Send blocking set to {}", blocked);
        self.state.send_gate.set_blocked(blocked);
    }

    pub fn is_sending_blocked(&self) -> bool {
        self.state.send_gate.is_blocked()
    }

    pub fn limits(&self) -> SessionLimits {
        self.state.limits()
    }

    pub fn session_count(&self) -> usize {
        self.state.sessions.len()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.state.sessions.snapshot()
    }

    // 修改会话参数，运行中时同步更新端点的服务端配置
    fn update_limits<F>(&self, f: F)
    where
        F: FnOnce(&mut SessionLimits),
    {
        let lifecycle = self.lock_lifecycle();
        self.state.update_config(|config| f(&mut config.limits));

        if let Lifecycle::Running(running) = &*lifecycle {
            let config = self.state.config_snapshot();
            match tls::build_server_config(
                config.certificate.as_deref(),
                config.private_key.as_deref(),
                &config.limits,
            ) {
                Ok(server_config) => running.endpoint.set_server_config(Some(server_config)),
                Err(e) => warn!("Failed to refresh QUIC server config: {}", e),
            }
        }
    }
}

impl Drop for DohFrontend {
    fn drop(&mut self) {
        self.stop();
        // 不阻塞地关闭运行时，可在异步上下文中释放句柄
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

// 等待端点的全部句柄与连接释放，直到监听地址可以重新绑定
async fn release_endpoint(
    endpoint: quinn::Endpoint,
    accept_task: JoinHandle<()>,
    local_addr: SocketAddr,
) {
    let _ = accept_task.await;
    endpoint.wait_idle().await;
    drop(endpoint);

    loop {
        if UdpSocket::bind(local_addr).is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// 解析地址与端口，地址可以是 IP 字面量或主机名
fn resolve_socket_addr(addr: &str, service: &str) -> Option<SocketAddr> {
    let port: u16 = service.trim().parse().ok()?;
    let host = addr.trim().trim_start_matches('[').trim_end_matches(']');

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, port));
    }

    if host.is_empty() {
        return None;
    }

    (host, port).to_socket_addrs().ok()?.next()
}


impl std::fmt::Debug for DohFrontend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DohFrontend").finish_non_exhaustive()
    }
}
