use crate::error::AppError;
use crate::r#const::shutdown_timeout;
use clap::{ArgAction, Parser};
use std::path::PathBuf;

// DoH over HTTP/3 前端服务
#[derive(Parser, Debug, Clone)]
#[command(
    name = "doh-frontend",
    author,
    version,
    about = "A DNS-over-HTTPS frontend serving RFC 8484 over HTTP/3 (QUIC)\n\n\
             Key Features:\n\
             - Transport: QUIC + TLS 1.3 with ALPN h3, PEM certificate and key\n\
             - Protocol: RFC 8484 GET (?dns=) and POST (application/dns-message)\n\
             - Backend Relay: Plain UDP DNS backend with bounded wait\n\
             - Session Control: Idle timeout, per-stream buffer limit, concurrent stream cap\n\
             - Observability: Query and connection counters, Prometheus metrics, admin API"
)]
pub struct Args {
    // 配置文件路径
    #[arg(short, long, default_value = "./config.yaml")]
    pub config: PathBuf,

    // 测试配置
    #[arg(
        short = 't',
        long = "test",
        action = ArgAction::SetTrue,
        help = "Test configuration file for validity and exit"
    )]
    pub test_config: bool,

    // 启用调试日志
    #[arg(
        short = 'd',
        long = "debug",
        action = ArgAction::SetTrue,
        help = "Enable debug level logging for detailed output"
    )]
    pub debug: bool,

    // 关闭超时
    #[arg(
        long = "shutdown-timeout",
        help = "Maximum time in seconds to wait for complete shutdown",
        default_value_t = shutdown_timeout::DEFAULT
    )]
    pub shutdown_timeout: u64,
}

impl Args {
    // 解析命令行参数
    pub fn parse_args() -> Self {
        Args::parse()
    }

    // 验证参数
    pub fn validation(&self) -> Result<(), AppError> {
        if self.shutdown_timeout < shutdown_timeout::MIN
            || self.shutdown_timeout > shutdown_timeout::MAX
        {
            return Err(AppError::InvalidShutdownTimeout);
        }
        Ok(())
    }
}
