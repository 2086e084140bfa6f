//! 本地端点绑定目标
//!
//! 优先级：显式 IP > 网卡名 > 不绑定（由路由表决定）。

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::TransportError;

/// 本地端点绑定目标
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BindTarget {
    /// 不绑定
    #[default]
    Any,
    /// 绑定到指定本地 IP
    Ip(IpAddr),
    /// 绑定到网卡（解析为该网卡的 IPv4 地址）
    Interface(String),
}

impl BindTarget {
    /// 由两个可选配置项构造（IP 优先于网卡名）
    pub fn from_options(
        bind_ip: Option<&str>,
        bind_interface: Option<&str>,
    ) -> Result<Self, TransportError> {
        if let Some(ip) = bind_ip.map(str::trim).filter(|s| !s.is_empty()) {
            let ip = ip.parse::<IpAddr>().map_err(|e| TransportError::Interface {
                name: ip.to_string(),
                reason: format!("invalid bind IP: {e}"),
            })?;
            return Ok(BindTarget::Ip(ip));
        }

        Ok(bind_interface
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|name| BindTarget::Interface(name.to_string()))
            .unwrap_or(BindTarget::Any))
    }

    /// 网卡名（仅 `Interface` 变体）
    pub fn interface_name(&self) -> Option<&str> {
        match self {
            BindTarget::Interface(name) => Some(name),
            _ => None,
        }
    }

    /// 解析出本地绑定 IP
    ///
    /// `Any` 返回 `None`。
    pub fn resolve(&self) -> Result<Option<IpAddr>, TransportError> {
        match self {
            BindTarget::Any => Ok(None),
            BindTarget::Ip(ip) => Ok(Some(*ip)),
            BindTarget::Interface(name) => interface_ipv4(name).map(Some),
        }
    }
}

impl FromStr for BindTarget {
    type Err = std::convert::Infallible;

    /// 能解析为 IP 的视为 IP，否则视为网卡名；空串为 `Any`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            Ok(BindTarget::Any)
        } else if let Ok(ip) = s.parse::<IpAddr>() {
            Ok(BindTarget::Ip(ip))
        } else {
            Ok(BindTarget::Interface(s.to_string()))
        }
    }
}

impl fmt::Display for BindTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindTarget::Any => f.write_str("any"),
            BindTarget::Ip(ip) => write!(f, "{ip}"),
            BindTarget::Interface(name) => write!(f, "if:{name}"),
        }
    }
}

/// 查询网卡的第一个 IPv4 地址
#[cfg(unix)]
pub fn interface_ipv4(name: &str) -> Result<IpAddr, TransportError> {
    use nix::ifaddrs::getifaddrs;
    use std::net::SocketAddrV4;

    let addrs = getifaddrs().map_err(|e| TransportError::Interface {
        name: name.to_string(),
        reason: format!("getifaddrs failed: {e}"),
    })?;

    let mut seen = false;
    for ifaddr in addrs {
        if ifaddr.interface_name != name {
            continue;
        }
        seen = true;

        if let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
            let v4 = SocketAddrV4::from(*sin);
            tracing::debug!("Resolved interface {} to {}", name, v4.ip());
            return Ok(IpAddr::V4(*v4.ip()));
        }
    }

    Err(TransportError::Interface {
        name: name.to_string(),
        reason: if seen {
            "no IPv4 address assigned".to_string()
        } else {
            "interface not found".to_string()
        },
    })
}

#[cfg(not(unix))]
pub fn interface_ipv4(name: &str) -> Result<IpAddr, TransportError> {
    Err(TransportError::Interface {
        name: name.to_string(),
        reason: "binding by interface name is only supported on Unix".to_string(),
    })
}
