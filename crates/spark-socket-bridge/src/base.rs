//! # base 模块说明
//!
//! ## 角色定位（Why）
//! - 字节流桥接与数据报桥接共享的套接字状态：协议栈端点、事件队列、协议组合、连接引用计数、
//!   硬错误缓存与 `SO_TIMESTAMP`；
//! - 承载与数据搬运无关的同步操作：bind / connect / disconnect / 地址查询 / 选项读写。
//!
//! ## 契约（What）
//! - 引用计数从 0 开始，每个客户端连接 +1，每次关闭 −1；归零恰好一次，低于零视为致命错误；
//! - 硬错误单元“未设置时才写入”，只接受 [`TransportError::is_hard`] 为真的错误，锁在产生错误的
//!   端点调用期间持有，保证并发调用方观测到的缓存值一致；
//! - 端点的 `close` 通过 [`BaseSocket::close_endpoint`] 调用，至多一次。

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::address::FullAddress;
use crate::endpoint::{
    NetworkProtocol, SocketOption, SocketOptionName, StackEndpoint, TransportProtocol, WriteError,
};
use crate::error::{Errno, SocketError, TransportError};
use crate::waiter::WaitQueue;

/// 能够从中识别协议栈错误的结果类型。
pub(crate) trait TransportFailure {
    fn transport_error(&self) -> Option<TransportError>;
}

impl TransportFailure for TransportError {
    fn transport_error(&self) -> Option<TransportError> {
        Some(*self)
    }
}

impl TransportFailure for WriteError {
    fn transport_error(&self) -> Option<TransportError> {
        match self {
            WriteError::Resolving(_) => None,
            WriteError::Failed(err) => Some(*err),
        }
    }
}

/// 共享的套接字状态。
pub struct BaseSocket {
    endpoint: Arc<dyn StackEndpoint>,
    queue: Arc<WaitQueue>,
    transport: TransportProtocol,
    network: NetworkProtocol,
    refcount: Mutex<u32>,
    hard_error: Mutex<Option<TransportError>>,
    timestamp: AtomicBool,
    endpoint_closed: AtomicBool,
}

impl BaseSocket {
    pub fn new(
        endpoint: Arc<dyn StackEndpoint>,
        queue: Arc<WaitQueue>,
        transport: TransportProtocol,
        network: NetworkProtocol,
    ) -> Self {
        Self {
            endpoint,
            queue,
            transport,
            network,
            refcount: Mutex::new(0),
            hard_error: Mutex::new(None),
            timestamp: AtomicBool::new(false),
            endpoint_closed: AtomicBool::new(false),
        }
    }

    pub fn endpoint(&self) -> &Arc<dyn StackEndpoint> {
        &self.endpoint
    }

    pub fn queue(&self) -> &Arc<WaitQueue> {
        &self.queue
    }

    pub fn transport(&self) -> TransportProtocol {
        self.transport
    }

    pub fn network(&self) -> NetworkProtocol {
        self.network
    }

    pub(crate) fn inc_ref(&self) {
        *self.refcount.lock() += 1;
    }

    /// 递减引用计数，归零时返回 `true`。
    ///
    /// # Panics
    /// 计数已为零（重复关闭）时 panic。
    pub(crate) fn dec_ref(&self) -> bool {
        let mut count = self.refcount.lock();
        if *count == 0 {
            drop(count);
            error!(transport = ?self.transport, "socket closed more times than it was opened");
            panic!("double close of {:?} socket", self.transport);
        }
        *count -= 1;
        *count == 0
    }

    /// 在持有硬错误锁的情况下执行一次端点调用，并按分类缓存硬错误。
    ///
    /// 返回调用结果以及调用后缓存中的硬错误（可能来自更早的调用）。
    pub(crate) fn with_hard_error<T, E, F>(&self, op: F) -> (Result<T, E>, Option<TransportError>)
    where
        E: TransportFailure,
        F: FnOnce(&dyn StackEndpoint) -> Result<T, E>,
    {
        let mut cell = self.hard_error.lock();
        let result = op(self.endpoint.as_ref());
        if cell.is_none()
            && let Err(err) = &result
            && let Some(err) = err.transport_error()
            && err.is_hard()
        {
            *cell = Some(err);
        }
        let cached = *cell;
        (result, cached)
    }

    /// 当前缓存的硬错误。
    pub fn hard_error(&self) -> Option<TransportError> {
        *self.hard_error.lock()
    }

    /// 端点进入错误态后只会报告笼统的关闭类错误，此时改为报告缓存的硬错误。
    pub(crate) fn prefer_hard_error(
        err: TransportError,
        hard: Option<TransportError>,
    ) -> TransportError {
        match (err, hard) {
            (
                TransportError::ClosedForReceive
                | TransportError::ClosedForSend
                | TransportError::ConnectionAborted,
                Some(hard),
            ) => hard,
            _ => err,
        }
    }

    pub(crate) fn close_endpoint(&self) {
        if !self.endpoint_closed.swap(true, Ordering::AcqRel) {
            self.endpoint.close();
        }
    }

    pub fn bind(&self, addr: &FullAddress) -> Result<(), SocketError> {
        self.endpoint.bind(addr)?;
        debug!(
            transport = ?self.transport,
            local = ?self.endpoint.local_address().ok(),
            "bind"
        );
        Ok(())
    }

    /// 连接到 `addr`；端口为 0 的未指定地址表示断开。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：
    ///   - IPv4 套接字拒绝 IPv6 目的地址（`EAFNOSUPPORT`）；
    ///   - 非阻塞连接已发起时返回 `EINPROGRESS`；
    ///   - 端点处于错误状态且硬错误已被其他路径读走时，协议栈会返回 `ConnectionAborted`，
    ///     此时以缓存的硬错误代替；
    /// - **风险 (Trade-offs)**：连接调用期间持有硬错误锁，与桥接循环的读写串行化。
    pub fn connect(&self, addr: &FullAddress) -> Result<(), SocketError> {
        if addr.is_disconnect() {
            self.endpoint.disconnect()?;
            debug!(transport = ?self.transport, "connect to unspecified address, disconnected");
            return Ok(());
        }
        if self.network == NetworkProtocol::Ipv4 && matches!(addr.addr, Some(IpAddr::V6(_))) {
            debug!(remote = %addr, "ipv4 socket rejects ipv6 destination");
            return Err(TransportError::AddressFamilyNotSupported.into());
        }

        let (result, hard) = self.with_hard_error(|endpoint| endpoint.connect(addr));
        match result {
            Ok(()) => {
                debug!(remote = %addr, "connect");
                Ok(())
            }
            Err(TransportError::ConnectStarted) => {
                debug!(
                    local = ?self.endpoint.local_address().ok(),
                    remote = %addr,
                    "connect started"
                );
                Err(TransportError::ConnectStarted.into())
            }
            Err(TransportError::ConnectionAborted) => Err(Self::prefer_hard_error(
                TransportError::ConnectionAborted,
                hard,
            )
            .into()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn disconnect(&self) -> Result<(), SocketError> {
        self.endpoint.disconnect()?;
        Ok(())
    }

    pub fn get_sock_name(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.endpoint.local_address()?.to_socket_addr(self.network))
    }

    pub fn get_peer_name(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.endpoint.remote_address()?.to_socket_addr(self.network))
    }

    /// 读取选项；`SO_TIMESTAMP` 由本层保存，`SO_ERROR` 优先返回缓存的硬错误。
    pub fn get_sock_opt(&self, name: SocketOptionName) -> Result<SocketOption, SocketError> {
        let option = match name {
            SocketOptionName::Timestamp => {
                SocketOption::Timestamp(self.timestamp.load(Ordering::Acquire))
            }
            SocketOptionName::Error => match self.hard_error() {
                Some(err) => SocketOption::Error(Some(err.to_errno())),
                None => self.endpoint.get_sock_opt(name)?,
            },
            _ => self.endpoint.get_sock_opt(name)?,
        };
        debug!(?option, "getsockopt");
        Ok(option)
    }

    pub fn set_sock_opt(&self, option: SocketOption) -> Result<(), SocketError> {
        match option {
            SocketOption::Timestamp(enabled) => {
                self.timestamp.store(enabled, Ordering::Release);
            }
            SocketOption::Error(_) => return Err(Errno::Enoprotoopt.into()),
            other => self.endpoint.set_sock_opt(other)?,
        }
        debug!(?option, "setsockopt");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stubs::MockEndpoint;
    use std::time::Duration;

    fn base(transport: TransportProtocol, network: NetworkProtocol) -> (BaseSocket, Arc<MockEndpoint>) {
        let queue = Arc::new(WaitQueue::new());
        let endpoint = MockEndpoint::new(transport, Arc::clone(&queue));
        let shared: Arc<dyn StackEndpoint> = endpoint.clone();
        (BaseSocket::new(shared, queue, transport, network), endpoint)
    }

    #[test]
    fn hard_error_cell_is_write_once() {
        let (base, _) = base(TransportProtocol::Tcp, NetworkProtocol::Ipv4);
        let (_, cached) =
            base.with_hard_error::<(), _, _>(|_| Err(TransportError::WouldBlock));
        assert_eq!(cached, None, "瞬时错误不得缓存");

        let (_, cached) =
            base.with_hard_error::<(), _, _>(|_| Err(TransportError::ConnectionReset));
        assert_eq!(cached, Some(TransportError::ConnectionReset));

        let (_, cached) = base.with_hard_error::<(), _, _>(|_| Err(TransportError::Timeout));
        assert_eq!(
            cached,
            Some(TransportError::ConnectionReset),
            "已缓存的硬错误不得被覆盖"
        );
        assert_eq!(
            base.get_sock_opt(SocketOptionName::Error).unwrap(),
            SocketOption::Error(Some(Errno::Econnreset))
        );
    }

    #[test]
    #[should_panic(expected = "double close")]
    fn refcount_below_zero_panics() {
        let (base, _) = base(TransportProtocol::Udp, NetworkProtocol::Ipv4);
        base.inc_ref();
        assert!(base.dec_ref());
        base.dec_ref();
    }

    #[test]
    fn connect_handles_disconnect_and_family_checks() {
        let (base, endpoint) = base(TransportProtocol::Udp, NetworkProtocol::Ipv4);
        base.connect(&FullAddress::from("[::ffff:0.0.0.0]:0".parse::<SocketAddr>().unwrap()))
            .unwrap();
        assert_eq!(endpoint.disconnect_count(), 1, "未指定地址 + 端口 0 应转为断开");

        let err = base
            .connect(&FullAddress::from("[2001:db8::1]:53".parse::<SocketAddr>().unwrap()))
            .unwrap_err();
        assert_eq!(err.errno(), Some(Errno::Eafnosupport));

        base.connect(&FullAddress::from("192.0.2.1:53".parse::<SocketAddr>().unwrap()))
            .unwrap();
        assert_eq!(
            base.get_peer_name().unwrap(),
            "192.0.2.1:53".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn connect_substitutes_cached_hard_error_for_abort() {
        let (base, endpoint) = base(TransportProtocol::Tcp, NetworkProtocol::Ipv4);
        let remote = FullAddress::from("192.0.2.1:80".parse::<SocketAddr>().unwrap());

        endpoint.fail_connect(TransportError::ConnectionRefused);
        let err = base.connect(&remote).unwrap_err();
        assert_eq!(err.errno(), Some(Errno::Econnrefused));

        endpoint.fail_connect(TransportError::ConnectionAborted);
        let err = base.connect(&remote).unwrap_err();
        assert_eq!(
            err.errno(),
            Some(Errno::Econnrefused),
            "ConnectionAborted 应被缓存的硬错误替换"
        );

        endpoint.fail_connect(TransportError::ConnectStarted);
        assert_eq!(
            base.connect(&remote).unwrap_err().errno(),
            Some(Errno::Einprogress)
        );
    }

    #[test]
    fn timestamp_is_kept_locally_and_other_options_forward() {
        let (base, endpoint) = base(TransportProtocol::Tcp, NetworkProtocol::Ipv6);
        base.set_sock_opt(SocketOption::Timestamp(true)).unwrap();
        assert_eq!(
            base.get_sock_opt(SocketOptionName::Timestamp).unwrap(),
            SocketOption::Timestamp(true)
        );

        base.set_sock_opt(SocketOption::TcpLinger2(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(
            endpoint.get_sock_opt(SocketOptionName::TcpLinger2).unwrap(),
            SocketOption::TcpLinger2(Duration::from_secs(5))
        );
        assert_eq!(
            base.set_sock_opt(SocketOption::Error(None)).unwrap_err().errno(),
            Some(Errno::Enoprotoopt)
        );
    }
}
