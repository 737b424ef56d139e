// 应用常量定义

//
// 配置参数限制常量
//

// 应用关闭等待时间限制
pub mod shutdown_timeout {
    // 默认值
    pub const DEFAULT: u64 = 30;
    // 最小值
    pub const MIN: u64 = 1;
    // 最大值
    pub const MAX: u64 = 120;
}

// 会话传输参数默认值与限制
pub mod session_limits {
    // 默认空闲超时（毫秒）
    pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 180_000;
    // 最大空闲超时（毫秒），QUIC 协商值上限
    pub const MAX_IDLE_TIMEOUT_MS: u64 = 600_000;
    // 默认单流缓冲上限（字节）
    pub const DEFAULT_MAX_BUFFER_SIZE: u64 = 1_000_000;
    // 最小缓冲上限（字节）
    pub const MIN_MAX_BUFFER_SIZE: u64 = 1;
    // 最大缓冲上限（字节）
    pub const MAX_MAX_BUFFER_SIZE: u64 = 10_000_000;
    // 默认并发双向流数量
    pub const DEFAULT_MAX_STREAMS_BIDI: u64 = 100;
    // 最大并发双向流数量
    pub const MAX_MAX_STREAMS_BIDI: u64 = 10_000;
    // QUIC 流接收窗口下限，避免极小缓冲导致流控停滞
    pub const MIN_STREAM_RECEIVE_WINDOW: u64 = 1_350;
}

// 固定的 QUIC 传输参数
pub mod transport_defaults {
    // 连接级接收窗口（字节）
    pub const CONNECTION_RECEIVE_WINDOW: u64 = 10_000_000;
    // 并发单向流数量，供 HTTP/3 控制流与 QPACK 流使用
    pub const MAX_STREAMS_UNI: u64 = 100;
    // 可接收的最大 UDP 载荷（字节）
    pub const MAX_DATAGRAM_SIZE: u16 = 1_350;
}

// 后端转发限制
pub mod backend_limits {
    // 默认后端等待时间（秒）
    pub const DEFAULT_TIMEOUT: u64 = 5;
    // 最小后端等待时间（秒）
    pub const MIN_TIMEOUT: u64 = 1;
    // 最大后端等待时间（秒）
    pub const MAX_TIMEOUT: u64 = 60;
    // UDP 响应最大长度
    pub const MAX_UDP_RESPONSE_SIZE: usize = 65_535;
}

// DoH 协议常量
pub mod doh_protocol {
    // RFC 8484 查询路径
    pub const QUERY_PATH: &str = "/dns-query";
    // GET 请求中的 DNS 参数名
    pub const DNS_PARAM: &str = "dns";
    // HTTP/3 ALPN 标识
    pub const ALPN_H3: &[u8] = b"h3";
    // 服务器停止时的 QUIC 关闭原因
    pub const CLOSE_REASON_STOPPED: &[u8] = b"server stopped";
    // 会话关闭时的 QUIC 关闭原因
    pub const CLOSE_REASON_SESSION: &[u8] = b"session closed";
}

// 指标标签
//
// 流错误类型标签
pub mod error_labels {
    // 缓冲区溢出
    pub const BUFFER_OVERFLOW: &str = "buffer_overflow";
    // 后端不可用
    pub const BACKEND_UNAVAILABLE: &str = "backend_unavailable";
    // 超出并发流限制
    pub const STREAM_LIMIT: &str = "stream_limit";
    // 错误的请求
    pub const BAD_REQUEST: &str = "bad_request";
    // 不支持的媒体类型
    pub const UNSUPPORTED_MEDIA_TYPE: &str = "unsupported_media_type";
    // 路径不存在
    pub const NOT_FOUND: &str = "not_found";
    // 不支持的方法
    pub const METHOD_NOT_ALLOWED: &str = "method_not_allowed";
    // 响应写入失败
    pub const SEND_ERROR: &str = "send_error";
}

// 请求方法标签
pub mod method_labels {
    pub const GET: &str = "get";
    pub const POST: &str = "post";
}

// 会话关闭原因标签
pub mod close_labels {
    // 空闲超时
    pub const IDLE_TIMEOUT: &str = "idle_timeout";
    // 对端关闭
    pub const PEER_CLOSED: &str = "peer_closed";
    // 服务器停止
    pub const STOPPED: &str = "stopped";
    // 协议错误
    pub const PROTOCOL_ERROR: &str = "protocol_error";
}

// 子系统名称
pub mod subsystem_names {
    // DoH 前端子系统
    pub const DOH_FRONTEND: &str = "doh_frontend";
    // 管理服务器子系统
    pub const ADMIN_SERVER: &str = "admin_server";
}

// 服务器默认值
pub mod server_defaults {
    // 默认管理服务器监听地址
    pub const DEFAULT_ADMIN_LISTEN: &str = "127.0.0.1:9000";
    // 运行时工作线程数
    pub const RUNTIME_WORKER_THREADS: usize = 2;
    // 运行时线程名称
    pub const RUNTIME_THREAD_NAME: &str = "doh-frontend";
    // 停止时等待监听套接字释放的上限（毫秒）
    pub const STOP_RELEASE_TIMEOUT_MS: u64 = 5_000;
}

// HTTP头常量
pub mod http_headers {
    // 内容类型常量
    pub mod content_types {
        // DNS消息内容类型
        pub const DNS_MESSAGE: &str = "application/dns-message";
    }
}
