use crate::config::validate_socket_addr;
use crate::r#const::{backend_limits, server_defaults, session_limits};
use serde::{Deserialize, Serialize};
use validator::Validate;

// 前端服务配置
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Validate)]
pub struct ServerConfig {
    // QUIC 监听地址
    #[validate(custom(
        function = "validate_socket_addr",
        message = "Listen address must be in ip:port form"
    ))]
    pub listen: String,
    // 后端 DNS 解析器地址
    #[validate(custom(
        function = "validate_socket_addr",
        message = "Backend address must be in ip:port form"
    ))]
    pub backend: String,
    // PEM 证书链文件
    #[validate(length(min = 1, message = "Certificate file path cannot be empty"))]
    pub cert_file: String,
    // PEM 私钥文件
    #[validate(length(min = 1, message = "Private key file path cannot be empty"))]
    pub key_file: String,
    // 空闲超时（毫秒），0 表示关闭
    #[serde(default = "default_max_idle_timeout")]
    #[validate(range(
        max = session_limits::MAX_IDLE_TIMEOUT_MS,
        message = "Idle timeout must not exceed {} milliseconds"
    ))]
    pub max_idle_timeout: u64,
    // 单流缓冲上限（字节）
    #[serde(default = "default_max_buffer_size")]
    #[validate(range(
        min = session_limits::MIN_MAX_BUFFER_SIZE,
        max = session_limits::MAX_MAX_BUFFER_SIZE,
        message = "Buffer size must be between {} and {} bytes"
    ))]
    pub max_buffer_size: u64,
    // 并发双向流上限
    #[serde(default = "default_max_streams_bidi")]
    #[validate(range(
        max = session_limits::MAX_MAX_STREAMS_BIDI,
        message = "Concurrent stream limit must not exceed {}"
    ))]
    pub max_streams_bidi: u64,
    // 后端等待时间（秒）
    #[serde(default = "default_backend_timeout")]
    #[validate(range(
        min = backend_limits::MIN_TIMEOUT,
        max = backend_limits::MAX_TIMEOUT,
        message = "Backend timeout must be between {} and {} seconds"
    ))]
    pub backend_timeout: u64,
}

fn default_max_idle_timeout() -> u64 {
    session_limits::DEFAULT_IDLE_TIMEOUT_MS
}

fn default_max_buffer_size() -> u64 {
    session_limits::DEFAULT_MAX_BUFFER_SIZE
}

fn default_max_streams_bidi() -> u64 {
    session_limits::DEFAULT_MAX_STREAMS_BIDI
}

fn default_backend_timeout() -> u64 {
    backend_limits::DEFAULT_TIMEOUT
}

// 管理服务器配置
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Validate)]
pub struct AdminConfig {
    // 管理服务器监听地址
    #[validate(custom(
        function = "validate_socket_addr",
        message = "Admin listen address must be in ip:port form"
    ))]
    pub listen: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen: server_defaults::DEFAULT_ADMIN_LISTEN.to_string(),
        }
    }
}
