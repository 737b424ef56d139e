// src/doh/state.rs

use crate::doh::session::SessionRegistry;
use crate::r#const::{backend_limits, session_limits};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Notify;

/// 运行统计计数器
///
/// 两个计数器均单调递增，只能通过显式的清零操作归零。
#[derive(Debug, Default)]
pub struct Stats {
    queries_received: AtomicU64,
    connections_accepted: AtomicU64,
}

/// 统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub queries_received: u64,
    pub connections_accepted: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    // 记录一个完整解码的查询
    pub fn record_query(&self) {
        self.queries_received.fetch_add(1, Ordering::Relaxed);
    }

    // 记录一个完成握手的连接
    pub fn record_connection(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            queries_received: self.queries_received.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
        }
    }

    // 查询计数清零，连接计数保持不变
    pub fn clear_queries(&self) {
        self.queries_received.store(0, Ordering::Relaxed);
    }

    // 连接计数清零，查询计数保持不变
    pub fn clear_connections(&self) {
        self.connections_accepted.store(0, Ordering::Relaxed);
    }
}

/// 发送阻断开关
///
/// 置位后所有流的出站写入都在 [`SendGate::wait_open`] 处挂起，连接保持打开；
/// 复位后挂起的写入立即继续。每次写入前都会读取一次标志。
#[derive(Debug, Default)]
pub struct SendGate {
    blocked: AtomicBool,
    notify: Notify,
}

impl SendGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::Release);
        if !blocked {
            self.notify.notify_waiters();
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    // 等待直到允许写入
    pub async fn wait_open(&self) {
        loop {
            // 先注册通知再检查标志，避免错过复位时的唤醒
            let notified = self.notify.notified();
            if !self.is_blocked() {
                return;
            }
            notified.await;
        }
    }
}

/// 会话创建时读取的传输参数快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    // 空闲超时（毫秒），0 表示不启用
    pub max_idle_timeout: u64,
    // 单流未解码字节上限
    pub max_buffer_size: u64,
    // 并发双向流上限
    pub max_streams_bidi: u64,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_idle_timeout: session_limits::DEFAULT_IDLE_TIMEOUT_MS,
            max_buffer_size: session_limits::DEFAULT_MAX_BUFFER_SIZE,
            max_streams_bidi: session_limits::DEFAULT_MAX_STREAMS_BIDI,
        }
    }
}

/// 运行时可修改的前端配置
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    // 监听地址
    pub listen_addr: SocketAddr,
    // 后端解析器地址
    pub backend_addr: SocketAddr,
    // PEM 格式证书链
    pub certificate: Option<String>,
    // PEM 格式私钥
    pub private_key: Option<String>,
    // 新会话使用的传输参数
    pub limits: SessionLimits,
    // 后端等待时间
    pub backend_timeout: Duration,
}

impl RuntimeConfig {
    pub fn new(listen_addr: SocketAddr, backend_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            backend_addr,
            certificate: None,
            private_key: None,
            limits: SessionLimits::default(),
            backend_timeout: Duration::from_secs(backend_limits::DEFAULT_TIMEOUT),
        }
    }
}

/// 前端共享状态
///
/// 生命周期控制器、监听器、会话与流处理共享同一份状态。
#[derive(Clone)]
pub struct AppState {
    /// 运行时配置，单写多读
    pub config: Arc<RwLock<RuntimeConfig>>,
    /// 统计计数器
    pub stats: Arc<Stats>,
    /// 发送阻断开关
    pub send_gate: Arc<SendGate>,
    /// 活跃会话表
    pub sessions: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            stats: Arc::new(Stats::new()),
            send_gate: Arc::new(SendGate::new()),
            sessions: Arc::new(SessionRegistry::new()),
        }
    }

    // 读取配置快照；锁中毒时沿用其中的数据
    pub fn config_snapshot(&self) -> RuntimeConfig {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    // 读取当前会话参数
    pub fn limits(&self) -> SessionLimits {
        match self.config.read() {
            Ok(guard) => guard.limits,
            Err(poisoned) => poisoned.into_inner().limits,
        }
    }

    pub fn backend_timeout(&self) -> Duration {
        match self.config.read() {
            Ok(guard) => guard.backend_timeout,
            Err(poisoned) => poisoned.into_inner().backend_timeout,
        }
    }

    // 在写锁内修改配置
    pub fn update_config<F>(&self, f: F)
    where
        F: FnOnce(&mut RuntimeConfig),
    {
        let mut guard = match self.config.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
    }
}
