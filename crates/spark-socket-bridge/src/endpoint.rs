//! # endpoint 模块说明
//!
//! ## 角色定位（Why）
//! - 定义桥接所消费的协议栈端点契约 [`StackEndpoint`] 与端点工厂 [`NetworkStack`]；
//! - 协议栈本身（TCP/UDP 状态机、路由、链路层）不在本 crate 内实现，只在此处约定边界。
//!
//! ## 契约要点（What）
//! - 端点的所有方法都是非阻塞的：无法立即完成时返回 [`TransportError::WouldBlock`] 等结果，
//!   并在状态变化时通过创建端点时传入的 [`WaitQueue`] 发出通知；
//! - 写入在链路地址解析未完成时返回 [`WriteError::Resolving`]，调用方等待其中的
//!   [`Resolution`] 完成后重试；类型层面保证“解析句柄”与“普通错误”不会同时出现；
//! - [`StackEndpoint::close`] 由桥接保证至多调用一次。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::address::FullAddress;
use crate::error::{Errno, TransportError};
use crate::handle::ShutdownMode;
use crate::waiter::{EventMask, WaitQueue};

/// 传输层协议。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TransportProtocol {
    Tcp,
    Udp,
    Icmpv4,
    Icmpv6,
}

impl TransportProtocol {
    /// 是否为字节流协议；字节流端点使用 stream 模式句柄并要求连接建立。
    pub fn is_stream(self) -> bool {
        matches!(self, TransportProtocol::Tcp)
    }
}

/// 网络层协议。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum NetworkProtocol {
    Ipv4,
    Ipv6,
}

/// 写入附加参数。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct WriteOptions {
    /// 目的地址；为空时使用已连接的对端。
    pub to: Option<FullAddress>,
}

/// 一次挂起中的链路地址解析。
///
/// 协议栈在解析完成（成功或失败）时触发对应的发送端；发送端被丢弃同样视为完成。
pub struct Resolution {
    done: oneshot::Receiver<()>,
}

impl Resolution {
    pub fn new(done: oneshot::Receiver<()>) -> Self {
        Self { done }
    }

    /// 创建一对“完成通知端 / 解析句柄”。
    pub fn channel() -> (oneshot::Sender<()>, Resolution) {
        let (tx, rx) = oneshot::channel();
        (tx, Resolution::new(rx))
    }

    /// 等待解析结束。
    pub async fn resolved(self) {
        let _ = self.done.await;
    }
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolution").finish_non_exhaustive()
    }
}

/// 端点写入失败。
#[derive(Debug, Error)]
pub enum WriteError {
    /// 链路地址解析尚未完成，等待后重试。
    #[error("link address resolution pending")]
    Resolving(Resolution),
    #[error(transparent)]
    Failed(#[from] TransportError),
}

/// `SO_LINGER` 取值。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LingerOption {
    pub enabled: bool,
    pub timeout: Duration,
}

/// 套接字选项名。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SocketOptionName {
    Timestamp,
    Linger,
    TcpLinger2,
    ReuseAddress,
    KeepAlive,
    NoDelay,
    ReceiveBufferSize,
    SendBufferSize,
    Broadcast,
    Error,
}

/// 已解码的套接字选项。
///
/// 选项的线格式编码不属于本 crate，RPC 层负责在字节与本枚举之间转换。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SocketOption {
    Timestamp(bool),
    Linger(LingerOption),
    TcpLinger2(Duration),
    ReuseAddress(bool),
    KeepAlive(bool),
    NoDelay(bool),
    ReceiveBufferSize(usize),
    SendBufferSize(usize),
    Broadcast(bool),
    /// `SO_ERROR`：只读，返回缓存的硬错误。
    Error(Option<Errno>),
}

impl SocketOption {
    pub fn name(&self) -> SocketOptionName {
        match self {
            SocketOption::Timestamp(_) => SocketOptionName::Timestamp,
            SocketOption::Linger(_) => SocketOptionName::Linger,
            SocketOption::TcpLinger2(_) => SocketOptionName::TcpLinger2,
            SocketOption::ReuseAddress(_) => SocketOptionName::ReuseAddress,
            SocketOption::KeepAlive(_) => SocketOptionName::KeepAlive,
            SocketOption::NoDelay(_) => SocketOptionName::NoDelay,
            SocketOption::ReceiveBufferSize(_) => SocketOptionName::ReceiveBufferSize,
            SocketOption::SendBufferSize(_) => SocketOptionName::SendBufferSize,
            SocketOption::Broadcast(_) => SocketOptionName::Broadcast,
            SocketOption::Error(_) => SocketOptionName::Error,
        }
    }
}

/// 协议栈传输端点。
///
/// # 教案式说明
/// - **意图 (Why)**：把“网络侧”抽象为一组非阻塞调用，桥接循环只依赖此契约，
///   测试可以用脚本化实现替换真实协议栈；
/// - **契约 (What)**：
///   - `read` 返回一个完整负载（字节流为当前可读的全部或部分字节，数据报为一个报文），
///     `addr` 非空时写入发送方地址；
///   - `write` 返回实际接受的字节数，可能小于 `data.len()`；
///   - `readiness(mask)` 返回 `mask` 中当前已就绪的事件，用于在清除信号前复核状态；
///   - `moderate_recv_buf` 在桥接把 `copied` 字节交付给客户端后调用，用于接收缓冲自动调节；
/// - **风险 (Trade-offs)**：方法在调用方任务中同步执行，实现不得阻塞。
pub trait StackEndpoint: Send + Sync {
    fn read(&self, addr: Option<&mut FullAddress>) -> Result<Bytes, TransportError>;

    fn write(&self, data: &[u8], options: &WriteOptions) -> Result<usize, WriteError>;

    fn connect(&self, addr: &FullAddress) -> Result<(), TransportError>;

    fn disconnect(&self) -> Result<(), TransportError>;

    fn bind(&self, addr: &FullAddress) -> Result<(), TransportError>;

    fn listen(&self, backlog: usize) -> Result<(), TransportError>;

    /// 取出一个已完成握手的连接及其事件队列。
    fn accept(
        &self,
        peer_addr: Option<&mut FullAddress>,
    ) -> Result<(Arc<dyn StackEndpoint>, Arc<WaitQueue>), TransportError>;

    fn shutdown(&self, how: ShutdownMode) -> Result<(), TransportError>;

    fn local_address(&self) -> Result<FullAddress, TransportError>;

    fn remote_address(&self) -> Result<FullAddress, TransportError>;

    fn readiness(&self, mask: EventMask) -> EventMask;

    fn get_sock_opt(&self, name: SocketOptionName) -> Result<SocketOption, TransportError>;

    fn set_sock_opt(&self, option: SocketOption) -> Result<(), TransportError>;

    fn moderate_recv_buf(&self, copied: usize);

    /// 释放端点；此后端点不再向事件队列发出通知。
    fn close(&self);
}

/// 协议栈：按协议组合创建端点。
pub trait NetworkStack: Send + Sync {
    fn new_endpoint(
        &self,
        transport: TransportProtocol,
        network: NetworkProtocol,
        queue: Arc<WaitQueue>,
    ) -> Result<Arc<dyn StackEndpoint>, TransportError>;
}
