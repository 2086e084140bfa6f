//! 绑定网卡的 TCP 连接
//!
//! 建连流程：
//!
//! 1. 解析远端地址
//! 2. 创建 socket，Linux 上若指定网卡则设置 `SO_BINDTODEVICE`
//! 3. `bind` 到网卡/IP 的本地地址（端口由系统分配）
//! 4. 设置 `TCP_NODELAY`、keepalive
//! 5. 带超时 `connect`

use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, TcpKeepalive, Type};
use tracing::{debug, info, warn};

use crate::{BindTarget, RetryPolicy, Transport, TransportError, TransportStats};

/// 最小读超时（`set_read_timeout(Some(0))` 在 std 中是非法参数）
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// 传输层配置
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// 本地端点绑定目标
    pub bind: BindTarget,
    /// 建连超时
    pub connect_timeout: Duration,
    /// 写超时
    pub write_timeout: Duration,
    /// 关闭 Nagle 合并（运动命令往返延迟敏感）
    pub nodelay: bool,
    /// TCP keepalive 空闲时间，`None` 表示不启用
    pub keepalive: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind: BindTarget::Any,
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            nodelay: true,
            keepalive: Some(Duration::from_secs(30)),
        }
    }
}

/// 绑定网卡的 TCP 连接
#[derive(Debug)]
pub struct BoundTransport {
    stream: Option<TcpStream>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    read_timeout: Option<Duration>,
    stats: TransportStats,
}

impl BoundTransport {
    /// 建立连接
    pub fn connect(host: &str, port: u16, config: &TransportConfig) -> Result<Self, TransportError> {
        let mut stats = TransportStats::new();
        stats.record_connection_attempt();

        match open_stream(host, port, config) {
            Ok(stream) => {
                let local_addr = stream.local_addr().map_err(|source| {
                    TransportError::SocketOption {
                        option: "local_addr",
                        source,
                    }
                })?;
                let remote_addr = stream.peer_addr().map_err(|source| {
                    TransportError::SocketOption {
                        option: "peer_addr",
                        source,
                    }
                })?;
                stats.record_successful_connection();
                info!("Connected {} -> {} (bind: {})", local_addr, remote_addr, config.bind);

                Ok(Self {
                    stream: Some(stream),
                    local_addr,
                    remote_addr,
                    read_timeout: None,
                    stats,
                })
            },
            Err(e) => {
                stats.record_failed_connection();
                Err(e)
            },
        }
    }

    /// 按重试策略建立连接
    pub fn connect_with_retry(
        host: &str,
        port: u16,
        config: &TransportConfig,
        policy: &RetryPolicy,
    ) -> Result<Self, TransportError> {
        policy.run(
            &format!("connect {host}:{port}"),
            |_| Self::connect(host, port, config),
            TransportError::is_retryable,
        )
    }

    /// 克隆出共享同一 socket 的句柄（用于独立的接收线程）
    pub fn try_clone(&self) -> Result<Self, TransportError> {
        let stream = self.stream.as_ref().ok_or(TransportError::NotConnected)?;
        let clone = stream.try_clone().map_err(|source| TransportError::SocketOption {
            option: "try_clone",
            source,
        })?;

        Ok(Self {
            stream: Some(clone),
            local_addr: self.local_addr,
            remote_addr: self.remote_addr,
            read_timeout: None,
            stats: self.stats.clone(),
        })
    }

    /// 关闭 socket 两个方向，但保留句柄
    ///
    /// 阻塞在其他克隆句柄上的 `receive` 会立即返回 `Closed`。
    pub fn shutdown(&self) {
        if let Some(stream) = &self.stream
            && let Err(e) = stream.shutdown(Shutdown::Both)
            && e.kind() != io::ErrorKind::NotConnected
        {
            debug!("shutdown {} failed: {}", self.remote_addr, e);
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::NotConnected)
    }
}

impl Transport for BoundTransport {
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream_mut()?;
        match stream.write_all(data).and_then(|_| stream.flush()) {
            Ok(()) => {
                self.stats.record_sent(data.len());
                Ok(())
            },
            Err(e) => {
                // 写超时可能已发出部分字节，帧边界不再可信，按 socket 故障处理
                self.stats.record_fault();
                Err(TransportError::Send(e))
            },
        }
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let timeout = timeout.max(MIN_READ_TIMEOUT);
        if self.read_timeout != Some(timeout) {
            let stream = self.stream_mut()?;
            stream
                .set_read_timeout(Some(timeout))
                .map_err(|source| TransportError::SocketOption {
                    option: "SO_RCVTIMEO",
                    source,
                })?;
            self.read_timeout = Some(timeout);
        }

        loop {
            let stream = self.stream_mut()?;
            match stream.read(buf) {
                Ok(0) if !buf.is_empty() => {
                    self.stats.record_fault();
                    return Err(TransportError::Closed);
                },
                Ok(n) => {
                    self.stats.record_received(n);
                    return Ok(n);
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Err(TransportError::Timeout(timeout));
                },
                Err(e) => {
                    self.stats.record_fault();
                    return Err(TransportError::Receive(e));
                },
            }
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            self.stats.record_disconnection();
            debug!("Closed connection {} -> {}", self.local_addr, self.remote_addr);
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

fn resolve_remote(host: &str, port: u16, local: Option<IpAddr>) -> Result<SocketAddr, TransportError> {
    let candidates: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| TransportError::Resolve {
            host: host.to_string(),
            reason: e.to_string(),
        })?
        .collect();

    // 本地地址族必须与远端一致
    let preferred = candidates
        .iter()
        .find(|addr| local.is_none_or(|ip| ip.is_ipv4() == addr.is_ipv4()))
        .or_else(|| candidates.first());

    preferred.copied().ok_or_else(|| TransportError::Resolve {
        host: host.to_string(),
        reason: "no addresses".to_string(),
    })
}

fn open_stream(host: &str, port: u16, config: &TransportConfig) -> Result<TcpStream, TransportError> {
    let local_ip = config.bind.resolve()?;
    let remote = resolve_remote(host, port, local_ip)?;
    let addr = remote.to_string();

    let socket = Socket::new(Domain::for_address(remote), Type::STREAM, Some(Protocol::TCP))
        .map_err(|source| TransportError::ConnectFailed {
            addr: addr.clone(),
            source,
        })?;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    if let Some(name) = config.bind.interface_name() {
        // 需要 CAP_NET_RAW；失败时仍可依靠源地址绑定
        if let Err(e) = socket.bind_device(Some(name.as_bytes())) {
            warn!("SO_BINDTODEVICE({}) failed: {}, falling back to address bind", name, e);
        }
    }

    if let Some(ip) = local_ip {
        let local = SockAddr::from(SocketAddr::new(ip, 0));
        socket.bind(&local).map_err(|source| TransportError::Bind {
            target: config.bind.to_string(),
            source,
        })?;
    }

    if config.nodelay {
        socket
            .set_nodelay(true)
            .map_err(|source| TransportError::SocketOption {
                option: "TCP_NODELAY",
                source,
            })?;
    }

    if let Some(idle) = config.keepalive {
        let keepalive = TcpKeepalive::new().with_time(idle);
        if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
            warn!("Failed to enable keepalive: {}", e);
        }
    }

    debug!("Connecting to {} (timeout {:?})", addr, config.connect_timeout);
    socket
        .connect_timeout(&SockAddr::from(remote), config.connect_timeout)
        .map_err(|source| match source.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportError::ConnectTimeout {
                addr: addr.clone(),
                timeout: config.connect_timeout,
            },
            _ => TransportError::ConnectFailed {
                addr: addr.clone(),
                source,
            },
        })?;

    let stream: TcpStream = socket.into();
    stream
        .set_write_timeout(Some(config.write_timeout.max(MIN_READ_TIMEOUT)))
        .map_err(|source| TransportError::SocketOption {
            option: "SO_SNDTIMEO",
            source,
        })?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn loopback_config() -> TransportConfig {
        TransportConfig {
            bind: BindTarget::Ip("127.0.0.1".parse().unwrap()),
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    #[test]
    fn test_connect_send_receive_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).unwrap();
            conn.write_all(b"pong\0").unwrap();
            buf
        });

        let mut transport = BoundTransport::connect("127.0.0.1", port, &loopback_config()).unwrap();
        assert!(transport.is_connected());
        assert_eq!(transport.local_addr().ip(), "127.0.0.1".parse::<IpAddr>().unwrap());
        transport.send(b"ping\0").unwrap();

        let mut buf = [0u8; 16];
        let n = transport.receive(&mut buf, Duration::from_secs(2)).unwrap();
        assert_eq!(&buf[..n], b"pong\0");
        assert_eq!(server.join().unwrap(), *b"ping\0");

        assert_eq!(transport.stats().bytes_sent, 5);
        assert_eq!(transport.stats().bytes_received, 5);

        transport.close();
        transport.close();
        assert!(!transport.is_connected());
        assert_eq!(transport.stats().disconnections, 1);
        assert!(matches!(
            transport.send(b"x"),
            Err(TransportError::NotConnected)
        ));
    }

    #[test]
    fn test_receive_timeout_keeps_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(200));
            drop(conn);
        });

        let mut transport = BoundTransport::connect("127.0.0.1", port, &loopback_config()).unwrap();
        let mut buf = [0u8; 8];
        let err = transport.receive(&mut buf, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
        assert!(transport.is_connected());

        server.join().unwrap();
        let err = transport.receive(&mut buf, Duration::from_secs(1)).unwrap_err();
        assert!(err.is_socket_failure(), "{err}");
    }

    #[test]
    fn test_shutdown_wakes_cloned_reader() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || listener.accept().unwrap());

        let transport = BoundTransport::connect("127.0.0.1", port, &loopback_config()).unwrap();
        let mut reader = transport.try_clone().unwrap();
        let _conn = server.join().unwrap();

        let handle = thread::spawn(move || {
            let mut buf = [0u8; 8];
            reader.receive(&mut buf, Duration::from_secs(5))
        });
        thread::sleep(Duration::from_millis(50));
        transport.shutdown();

        let result = handle.join().unwrap();
        assert!(matches!(result, Err(e) if e.is_socket_failure()));
    }

    #[test]
    fn test_connect_refused() {
        // 绑定后立即释放，得到一个当前无人监听的端口
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let err = BoundTransport::connect("127.0.0.1", port, &loopback_config()).unwrap_err();
        assert!(err.is_connect_error(), "{err}");
    }

    #[test]
    fn test_retry_policy_gives_up() {
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let policy = RetryPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_millis(2),
        };

        let result = BoundTransport::connect_with_retry("127.0.0.1", port, &loopback_config(), &policy);
        assert!(result.is_err());
    }

    #[test]
    fn test_unresolvable_host() {
        let err =
            BoundTransport::connect("host.invalid", 10000, &TransportConfig::default()).unwrap_err();
        assert!(matches!(err, TransportError::Resolve { .. }), "{err}");
    }
}
