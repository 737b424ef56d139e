use axum::http::{header, StatusCode};
use axum::{routing::get, Router};
use once_cell::sync::Lazy;
use prometheus::{opts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry};

// 全局静态指标实例
pub static METRICS: Lazy<DohMetrics> = Lazy::new(DohMetrics::new);

// DoH 前端运行指标
pub struct DohMetrics {
    registry: Registry,

    // 1. 连接与会话指标
    connections_total: IntCounter,
    handshake_failures_total: IntCounter,
    active_sessions: IntGauge,
    session_closes_total: IntCounterVec,

    // 2. 请求处理指标
    dns_queries_total: IntCounterVec,
    dns_request_duration_seconds: HistogramVec,
    stream_errors_total: IntCounterVec,

    // 3. 后端转发指标
    backend_duration_seconds: HistogramVec,
}

impl Default for DohMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DohMetrics {
    // 创建新的指标收集器
    pub fn new() -> Self {
        let registry = Registry::new();

        // 1. 连接与会话指标
        let connections_total = IntCounter::new(
            "dohfront_connections_total",
            "Total QUIC connections that completed the TLS handshake",
        )
        .unwrap();

        let handshake_failures_total = IntCounter::new(
            "dohfront_handshake_failures_total",
            "Total QUIC connections dropped during the handshake",
        )
        .unwrap();

        let active_sessions = IntGauge::new(
            "dohfront_active_sessions",
            "Current number of established sessions",
        )
        .unwrap();

        let session_closes_total = IntCounterVec::new(
            opts!(
                "dohfront_session_closes_total",
                "Total closed sessions, classified by close reason"
            ),
            &["reason"],
        )
        .unwrap();

        // 2. 请求处理指标
        let dns_queries_total = IntCounterVec::new(
            opts!(
                "dohfront_dns_queries_total",
                "Total decoded DNS queries, classified by HTTP method"
            ),
            &["method"],
        )
        .unwrap();

        let dns_request_duration_seconds = HistogramVec::new(
            prometheus::histogram_opts!(
                "dohfront_dns_request_duration_seconds",
                "DoH exchange duration in seconds from decoded query to written response",
                vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
            ),
            &["method"],
        )
        .unwrap();

        let stream_errors_total = IntCounterVec::new(
            opts!(
                "dohfront_stream_errors_total",
                "Total failed request streams, classified by error type"
            ),
            &["error_type"],
        )
        .unwrap();

        // 3. 后端转发指标
        let backend_duration_seconds = HistogramVec::new(
            prometheus::histogram_opts!(
                "dohfront_backend_duration_seconds",
                "Backend resolver round-trip duration in seconds",
                vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
            ),
            &["backend"],
        )
        .unwrap();

        // 创建指标实例
        let metrics = DohMetrics {
            registry,
            connections_total,
            handshake_failures_total,
            active_sessions,
            session_closes_total,
            dns_queries_total,
            dns_request_duration_seconds,
            stream_errors_total,
            backend_duration_seconds,
        };

        // 注册所有指标
        metrics.register_all_metrics();

        metrics
    }

    // 注册所有指标
    fn register_all_metrics(&self) {
        // 1. 连接与会话指标
        self.registry
            .register(Box::new(self.connections_total.clone()))
            .unwrap();
        self.registry
            .register(Box::new(self.handshake_failures_total.clone()))
            .unwrap();
        self.registry
            .register(Box::new(self.active_sessions.clone()))
            .unwrap();
        self.registry
            .register(Box::new(self.session_closes_total.clone()))
            .unwrap();

        // 2. 请求处理指标
        self.registry
            .register(Box::new(self.dns_queries_total.clone()))
            .unwrap();
        self.registry
            .register(Box::new(self.dns_request_duration_seconds.clone()))
            .unwrap();
        self.registry
            .register(Box::new(self.stream_errors_total.clone()))
            .unwrap();

        // 3. 后端转发指标
        self.registry
            .register(Box::new(self.backend_duration_seconds.clone()))
            .unwrap();
    }

    // 获取 Prometheus 注册表
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    // 导出所有指标为输出字符串
    pub fn export_metrics(&self) -> String {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = String::new();
        if let Err(e) = encoder.encode_utf8(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
        }
        buffer
    }

    // 下面是各个指标的getter方法，用于其他模块增加计数或设置值

    // 1. 连接与会话指标
    pub fn connections_total(&self) -> &IntCounter {
        &self.connections_total
    }

    pub fn handshake_failures_total(&self) -> &IntCounter {
        &self.handshake_failures_total
    }

    pub fn active_sessions(&self) -> &IntGauge {
        &self.active_sessions
    }

    pub fn session_closes_total(&self) -> &IntCounterVec {
        &self.session_closes_total
    }

    // 2. 请求处理指标
    pub fn dns_queries_total(&self) -> &IntCounterVec {
        &self.dns_queries_total
    }

    pub fn dns_request_duration_seconds(&self) -> &HistogramVec {
        &self.dns_request_duration_seconds
    }

    pub fn stream_errors_total(&self) -> &IntCounterVec {
        &self.stream_errors_total
    }

    // 3. 后端转发指标
    pub fn backend_duration_seconds(&self) -> &HistogramVec {
        &self.backend_duration_seconds
    }
}

// 提供指标导出路由
pub fn metrics_routes<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route(
        "/metrics",
        get(|| async {
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
                METRICS.export_metrics(),
            )
        }),
    )
}
