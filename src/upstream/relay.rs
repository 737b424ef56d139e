use crate::error::AppError;
use crate::metrics::METRICS;
use crate::r#const::backend_limits;
use bytes::Bytes;
use hickory_proto::op::{Message, MessageType};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::debug;

/// 后端转发器
///
/// 通过无连接的 UDP 请求/应答把原始 DNS 查询转发给后端解析器，
/// 等待时间有上限。不做缓存与重试。
#[derive(Debug, Clone)]
pub struct BackendRelay {
    backend: SocketAddr,
    timeout: Duration,
}

impl BackendRelay {
    pub fn new(backend: SocketAddr, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    // 使用新的等待时间，后端地址不变
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            backend: self.backend,
            timeout,
        }
    }

    /// 转发查询并返回后端的原始应答字节
    pub async fn relay(&self, query: &[u8]) -> Result<Bytes, AppError> {
        if query.len() < 2 {
            return Err(AppError::Internal("DNS query is too short".to_string()));
        }

        let start_time = Instant::now();
        let result = tokio::time::timeout(self.timeout, self.exchange(query)).await;

        match result {
            Ok(Ok(response)) => {
                METRICS
                    .backend_duration_seconds()
                    .with_label_values(&[&self.backend.to_string()])
                    .observe(start_time.elapsed().as_secs_f64());
                Ok(response)
            }
            Ok(Err(e)) => Err(AppError::BackendUnavailable(format!(
                "{}: {}",
                self.backend, e
            ))),
            Err(_) => Err(AppError::BackendUnavailable(format!(
                "{}: no reply within {:?}",
                self.backend, self.timeout
            ))),
        }
    }

    async fn exchange(&self, query: &[u8]) -> io::Result<Bytes> {
        // 按后端地址族选择本地绑定地址
        let bind_addr = if self.backend.is_ipv6() {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        };

        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(self.backend).await?;
        socket.send(query).await?;

        let mut buf = vec![0u8; backend_limits::MAX_UDP_RESPONSE_SIZE];
        loop {
            let len = socket.recv(&mut buf).await?;
            if is_matching_response(query, &buf[..len]) {
                return Ok(Bytes::copy_from_slice(&buf[..len]));
            }
            debug!(
                "Discarding unexpected {} byte datagram from backend {}",
                len, self.backend
            );
        }
    }
}

// 应答必须是与查询 ID 相同的 DNS 响应
fn is_matching_response(query: &[u8], response: &[u8]) -> bool {
    if response.len() < 2 || response[..2] != query[..2] {
        return false;
    }

    match Message::from_vec(response) {
        Ok(message) => message.message_type() == MessageType::Response,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use hickory_proto::op::{OpCode, Query};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::str::FromStr;

    fn build_query(id: u16) -> Vec<u8> {
        let mut message = Message::new();
        message.set_id(id);
        message.set_op_code(OpCode::Query);
        message.set_recursion_desired(true);
        message.add_query(Query::query(
            Name::from_str("example.com.").unwrap(),
            RecordType::A,
        ));
        message.to_vec().unwrap()
    }

    fn answer_for(query: &[u8], id: u16) -> Vec<u8> {
        let request = Message::from_vec(query).unwrap();
        let mut response = Message::new();
        response.set_id(id);
        response.set_message_type(MessageType::Response);
        response.set_recursion_available(true);
        for q in request.queries() {
            response.add_query(q.clone());
        }
        let mut record = Record::with(Name::from_str("example.com.").unwrap(), RecordType::A, 300);
        record.set_data(Some(RData::A(A(Ipv4Addr::new(192, 0, 2, 1)))));
        response.add_answer(record);
        response.to_vec().unwrap()
    }

    // 启动一个按需应答的假后端
    async fn spawn_backend(wrong_id_first: bool) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let (len, peer) = match socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(_) => return,
                };
                let query = buf[..len].to_vec();
                let id = u16::from_be_bytes([query[0], query[1]]);
                if wrong_id_first {
                    let _ = socket
                        .send_to(&answer_for(&query, id.wrapping_add(1)), peer)
                        .await;
                }
                let _ = socket.send_to(&answer_for(&query, id), peer).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_relay_returns_backend_bytes() {
        let backend = spawn_backend(false).await;
        let relay = BackendRelay::new(backend, Duration::from_secs(2));
        let query = build_query(0x1234);

        let response = relay.relay(&query).await.unwrap();
        assert_eq!(response.as_ref(), answer_for(&query, 0x1234).as_slice());
    }

    #[tokio::test]
    async fn test_relay_skips_mismatched_ids() {
        let backend = spawn_backend(true).await;
        let relay = BackendRelay::new(backend, Duration::from_secs(2));
        let query = build_query(7);

        let response = relay.relay(&query).await.unwrap();
        let message = Message::from_vec(&response).unwrap();
        assert_eq!(message.id(), 7);
    }

    #[tokio::test]
    async fn test_relay_times_out_on_silent_backend() {
        // 绑定但从不应答
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let relay = BackendRelay::new(silent.local_addr().unwrap(), Duration::from_millis(200));

        let start = Instant::now();
        assert_matches!(
            relay.relay(&build_query(1)).await,
            Err(AppError::BackendUnavailable(_))
        );
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_relay_rejects_truncated_query() {
        let relay = BackendRelay::new("127.0.0.1:53".parse().unwrap(), Duration::from_secs(1));
        assert_matches!(relay.relay(&[0u8]).await, Err(AppError::Internal(_)));
    }

    #[test]
    fn test_matching_response_requires_response_flag() {
        let query = build_query(42);
        assert!(!is_matching_response(&query, &query));
        assert!(is_matching_response(&query, &answer_for(&query, 42)));
        assert!(!is_matching_response(&query, &answer_for(&query, 43)));
        assert!(!is_matching_response(&query, &[0]));
    }
}
