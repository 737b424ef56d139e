// src/doh/mod.rs
//
// DoH over HTTP/3 前端实现，支持:
// - RFC 8484: GET (?dns=) 与 POST (application/dns-message)
// - QUIC + TLS 1.3 传输，ALPN h3

// 子模块定义
pub mod handlers;
pub mod listener;
pub mod session;
pub mod state;
pub mod tls;

// 公开导出
pub use handlers::DohHandler;
pub use session::{Session, SessionInfo, SessionRegistry, SessionState};
pub use state::{AppState, RuntimeConfig, SessionLimits, Stats, StatsSnapshot};
