pub mod admin;
pub mod args;
pub mod config;
pub mod r#const;
pub mod doh;
pub mod error;
pub mod frontend;
pub mod metrics;
pub mod server;
pub mod upstream;

// 重导出常用组件
pub use admin::AdminServer;
pub use args::Args;
pub use config::Config;
pub use doh::{SessionInfo, SessionState, StatsSnapshot};
pub use error::{AppError, ConfigError};
pub use frontend::DohFrontend;
pub use metrics::DohMetrics;
pub use r#const::subsystem_names;
pub use server::FrontendService;
pub use upstream::BackendRelay;
