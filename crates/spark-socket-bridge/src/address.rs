//! 传输层完整地址及其与 `std::net::SocketAddr` 的互转。

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::endpoint::NetworkProtocol;

/// 网卡编号 + 地址 + 端口。
///
/// - `addr == None` 表示未指定地址（绑定到任意地址或尚未连接）；
/// - `nic == 0` 表示不限定网卡。
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct FullAddress {
    pub nic: u32,
    pub addr: Option<IpAddr>,
    pub port: u16,
}

impl FullAddress {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self {
            nic: 0,
            addr: Some(addr),
            port,
        }
    }

    /// 判断以该地址调用 `connect` 是否表示断开连接。
    ///
    /// 端口为 0 且地址为空或为未指定地址时成立；IPv4 映射的未指定地址 `::ffff:0.0.0.0`
    /// 同样视为未指定。
    pub fn is_disconnect(&self) -> bool {
        self.port == 0
            && match self.addr {
                None => true,
                Some(IpAddr::V4(v4)) => v4.is_unspecified(),
                Some(IpAddr::V6(v6)) => {
                    v6.is_unspecified()
                        || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_unspecified())
                }
            }
    }

    /// 按套接字的网络层协议转换为 `SocketAddr`。
    ///
    /// IPv6 套接字上的 IPv4 地址以映射形式返回；未指定地址按协议补零。
    pub fn to_socket_addr(&self, network: NetworkProtocol) -> SocketAddr {
        match (network, self.addr) {
            (NetworkProtocol::Ipv4, Some(IpAddr::V4(v4))) => {
                SocketAddr::V4(SocketAddrV4::new(v4, self.port))
            }
            (NetworkProtocol::Ipv4, Some(IpAddr::V6(v6))) => SocketAddr::V6(SocketAddrV6::new(
                v6, self.port, 0, self.nic,
            )),
            (NetworkProtocol::Ipv4, None) => {
                SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.port))
            }
            (NetworkProtocol::Ipv6, addr) => {
                let v6 = match addr {
                    Some(IpAddr::V6(v6)) => v6,
                    Some(IpAddr::V4(v4)) => v4.to_ipv6_mapped(),
                    None => Ipv6Addr::UNSPECIFIED,
                };
                SocketAddr::V6(SocketAddrV6::new(v6, self.port, 0, self.nic))
            }
        }
    }
}

impl From<SocketAddr> for FullAddress {
    fn from(value: SocketAddr) -> Self {
        match value {
            SocketAddr::V4(v4) => FullAddress::new(IpAddr::V4(*v4.ip()), v4.port()),
            SocketAddr::V6(v6) => FullAddress {
                nic: v6.scope_id(),
                addr: Some(IpAddr::V6(*v6.ip())),
                port: v6.port(),
            },
        }
    }
}

impl fmt::Display for FullAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            Some(addr) => write!(f, "{}", SocketAddr::new(addr, self.port))?,
            None => write!(f, "*:{}", self.port)?,
        }
        if self.nic != 0 {
            write!(f, "%{}", self.nic)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unspecified_with_zero_port_means_disconnect() {
        assert!(FullAddress::default().is_disconnect());
        assert!(FullAddress::from("0.0.0.0:0".parse::<SocketAddr>().unwrap()).is_disconnect());
        assert!(FullAddress::from("[::]:0".parse::<SocketAddr>().unwrap()).is_disconnect());
        assert!(
            FullAddress::from("[::ffff:0.0.0.0]:0".parse::<SocketAddr>().unwrap())
                .is_disconnect(),
            "IPv4 映射的未指定地址同样表示断开"
        );
        assert!(!FullAddress::from("0.0.0.0:80".parse::<SocketAddr>().unwrap()).is_disconnect());
        assert!(!FullAddress::from("10.0.0.1:0".parse::<SocketAddr>().unwrap()).is_disconnect());
    }

    #[test]
    fn conversion_follows_socket_family() {
        let addr = FullAddress::from("192.0.2.7:53".parse::<SocketAddr>().unwrap());
        assert_eq!(
            addr.to_socket_addr(NetworkProtocol::Ipv4),
            "192.0.2.7:53".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            addr.to_socket_addr(NetworkProtocol::Ipv6),
            "[::ffff:192.0.2.7]:53".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            FullAddress::default().to_socket_addr(NetworkProtocol::Ipv6),
            "[::]:0".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(addr.to_string(), "192.0.2.7:53");
    }
}
