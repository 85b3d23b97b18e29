//! 套接字工厂：校验地址族与协议，创建协议栈端点并包装为桥接。

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::base::BaseSocket;
use crate::config::BridgeConfig;
use crate::datagram::{DatagramBridge, DatagramSocket};
use crate::endpoint::{NetworkProtocol, NetworkStack, TransportProtocol};
use crate::error::{ConfigError, Errno, SocketError};
use crate::registry::SocketRegistry;
use crate::stream::{StreamBridge, StreamSocket};
use crate::waiter::WaitQueue;

/// 地址族。`Unknown` 承载 RPC 层送来的未识别取值。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Domain {
    Ipv4,
    Ipv6,
    Unknown(u32),
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum StreamSocketProtocol {
    Tcp,
    Unknown(u32),
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DatagramSocketProtocol {
    Udp,
    /// ICMP echo，按地址族映射为 ICMPv4 或 ICMPv6。
    IcmpEcho,
    Unknown(u32),
}

fn network_protocol(domain: Domain) -> Result<NetworkProtocol, SocketError> {
    match domain {
        Domain::Ipv4 => Ok(NetworkProtocol::Ipv4),
        Domain::Ipv6 => Ok(NetworkProtocol::Ipv6),
        Domain::Unknown(_) => Err(Errno::Epfnosupport.into()),
    }
}

/// 套接字工厂。
///
/// # 教案式说明
/// - **意图 (Why)**：把“地址族/协议合法性校验 → 创建端点 → 构造桥接 → 建立首个客户端连接”
///   收敛为单一入口，调用方无需了解桥接内部的构造顺序；
/// - **契约 (What)**：
///   - 未知地址族返回 `EPFNOSUPPORT`，先于协议校验；
///   - 未知协议返回 `EPROTONOSUPPORT`；
///   - 端点创建失败时返回协议栈错误对应的错误码；
///   - 同一工厂创建的桥接共享一个 [`SocketRegistry`] 与一份 [`BridgeConfig`]；
///   - 配置在构造工厂时校验，非法配置返回 [`ConfigError`]。
pub struct SocketProvider {
    stack: Arc<dyn NetworkStack>,
    registry: Arc<SocketRegistry>,
    config: Arc<BridgeConfig>,
}

impl SocketProvider {
    /// 创建工厂；配置先经 [`BridgeConfig::validate`] 校验。
    pub fn new(stack: Arc<dyn NetworkStack>, config: BridgeConfig) -> Result<Self, ConfigError> {
        Self::with_registry(stack, Arc::new(SocketRegistry::new()), config)
    }

    /// 与其他组件共享登记表的工厂。
    ///
    /// 写块大小为零时写循环会在空缓冲上空转，因此非法配置在这里即被拒绝。
    pub fn with_registry(
        stack: Arc<dyn NetworkStack>,
        registry: Arc<SocketRegistry>,
        config: BridgeConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            stack,
            registry,
            config: Arc::new(config),
        })
    }

    pub fn registry(&self) -> &Arc<SocketRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// 创建字节流套接字。
    pub async fn stream_socket(
        &self,
        domain: Domain,
        protocol: StreamSocketProtocol,
    ) -> Result<StreamSocket, SocketError> {
        let network = network_protocol(domain)?;
        let transport = match protocol {
            StreamSocketProtocol::Tcp => TransportProtocol::Tcp,
            StreamSocketProtocol::Unknown(_) => return Err(Errno::Eprotonosupport.into()),
        };

        let queue = Arc::new(WaitQueue::new());
        let endpoint = self
            .stack
            .new_endpoint(transport, network, Arc::clone(&queue))?;
        let base = BaseSocket::new(endpoint, queue, transport, network);
        let bridge =
            StreamBridge::start(base, Arc::clone(&self.registry), Arc::clone(&self.config)).await;
        debug!(koid = bridge.koid(), ?network, "new stream socket");
        Ok(StreamSocket::attach(bridge))
    }

    /// 创建数据报套接字。
    pub fn datagram_socket(
        &self,
        domain: Domain,
        protocol: DatagramSocketProtocol,
    ) -> Result<DatagramSocket, SocketError> {
        let network = network_protocol(domain)?;
        let transport = match (protocol, network) {
            (DatagramSocketProtocol::Udp, _) => TransportProtocol::Udp,
            (DatagramSocketProtocol::IcmpEcho, NetworkProtocol::Ipv4) => TransportProtocol::Icmpv4,
            (DatagramSocketProtocol::IcmpEcho, NetworkProtocol::Ipv6) => TransportProtocol::Icmpv6,
            (DatagramSocketProtocol::Unknown(_), _) => return Err(Errno::Eprotonosupport.into()),
        };

        let queue = Arc::new(WaitQueue::new());
        let endpoint = self
            .stack
            .new_endpoint(transport, network, Arc::clone(&queue))?;
        let base = BaseSocket::new(endpoint, queue, transport, network);
        let bridge = DatagramBridge::new(base, Arc::clone(&self.registry));
        debug!(koid = bridge.koid(), ?transport, ?network, "new datagram socket");
        Ok(DatagramSocket::attach(bridge))
    }
}

impl fmt::Debug for SocketProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketProvider")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}
