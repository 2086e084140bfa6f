//! 连接统计

use std::time::SystemTime;

use crate::ConnectionState;

/// 单条连接的统计信息
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connection_attempts: u64,
    pub successful_connections: u64,
    pub failed_connections: u64,
    pub disconnections: u64,
    /// 最近一次连接成功时间
    pub last_connection: Option<SystemTime>,
    pub connection_state: ConnectionState,
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection_attempt(&mut self) {
        self.connection_attempts += 1;
        self.connection_state = ConnectionState::Connecting;
    }

    pub fn record_successful_connection(&mut self) {
        self.successful_connections += 1;
        self.last_connection = Some(SystemTime::now());
        self.connection_state = ConnectionState::Connected;
    }

    pub fn record_failed_connection(&mut self) {
        self.failed_connections += 1;
        self.connection_state = ConnectionState::Faulted;
    }

    pub fn record_disconnection(&mut self) {
        self.disconnections += 1;
        self.connection_state = ConnectionState::Disconnected;
    }

    pub fn record_fault(&mut self) {
        self.connection_state = ConnectionState::Faulted;
    }

    pub fn record_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
    }
}
