//! # datagram 模块说明
//!
//! ## 角色定位（Why）
//! - UDP / ICMP 套接字不经由数据句柄搬运：客户端通过 `recv_msg` / `send_msg` 同步收发报文，
//!   事件对（event pair）只承载就绪信号；
//! - 因此数据报桥接没有后台任务，全部状态转换发生在调用方任务或事件队列回调中。
//!
//! ## 信号约定（What）
//! - 创建后立即向客户端发布 `OUTGOING`（数据报端点随时可写）；
//! - 端点有入站报文时置位 `INCOMING`，`recv_msg` 成功取空后清除，两者都在 `incoming` 锁内复核端点就绪状态；
//! - `shutdown` 向客户端发布 `SHUTDOWN_READ` / `SHUTDOWN_WRITE`。
//!
//! ## 风险提示（Trade-offs）
//! - `peek` 读取的报文缓存在桥接内，此时端点已不再报告可读，清除 `INCOMING` 前需同时确认缓存为空。

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::address::FullAddress;
use crate::base::BaseSocket;
use crate::endpoint::{NetworkProtocol, SocketOption, SocketOptionName, WriteError, WriteOptions};
use crate::error::{Errno, SocketError, TransportError};
use crate::handle::{Handle, Koid, ShutdownMode, Signals};
use crate::registry::SocketRegistry;
use crate::waiter::{EntryId, EventMask};

/// `recv_msg` 的结果。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecvMsgResponse {
    /// 发送方地址，仅在请求时填充。
    pub addr: Option<SocketAddr>,
    pub data: Bytes,
    /// 因 `data_len` 限制被截掉的字节数。
    pub truncated: usize,
}

/// 数据报 / 事件桥接。
pub struct DatagramBridge {
    base: BaseSocket,
    koid: Koid,
    local: Handle,
    peer: Handle,
    pending: Mutex<Option<(Bytes, FullAddress)>>,
    incoming: Mutex<bool>,
    entry: Mutex<Option<EntryId>>,
    registry: Arc<SocketRegistry>,
}

impl DatagramBridge {
    /// 创建桥接：注册 `IN` 回调、登记端点并向客户端发布 `OUTGOING`。
    pub fn new(base: BaseSocket, registry: Arc<SocketRegistry>) -> Arc<DatagramBridge> {
        let (local, peer) = Handle::event_pair();
        let bridge = Arc::new(DatagramBridge {
            koid: local.koid(),
            base,
            local,
            peer,
            pending: Mutex::new(None),
            incoming: Mutex::new(false),
            entry: Mutex::new(None),
            registry,
        });

        let weak = Arc::downgrade(&bridge);
        let entry = bridge.base.queue().register(EventMask::IN, move |_| {
            if let Some(bridge) = weak.upgrade() {
                bridge.assert_incoming();
            }
        });
        *bridge.entry.lock() = Some(entry);

        bridge
            .registry
            .add(bridge.koid, Arc::clone(bridge.base.endpoint()));
        bridge.signal_client(Signals::empty(), Signals::OUTGOING);

        debug!(koid = bridge.koid, transport = ?bridge.base.transport(), "datagram bridge created");
        bridge
    }

    pub fn koid(&self) -> Koid {
        self.koid
    }

    pub fn base(&self) -> &BaseSocket {
        &self.base
    }

    fn signal_client(&self, clear: Signals, set: Signals) {
        if let Err(err) = self.local.signal_peer(clear, set) {
            error!(koid = self.koid, error = %err, ?set, "failed to signal datagram client");
            panic!("datagram bridge {}: signal peer {set:?} failed: {err}", self.koid);
        }
    }

    fn assert_incoming(&self) {
        let mut incoming = self.incoming.lock();
        if !*incoming && !self.base.endpoint().readiness(EventMask::IN).is_empty() {
            self.signal_client(Signals::empty(), Signals::INCOMING);
            *incoming = true;
        }
    }

    fn clear_incoming(&self, buffered: bool) {
        let mut incoming = self.incoming.lock();
        if *incoming && !buffered && self.base.endpoint().readiness(EventMask::IN).is_empty() {
            self.signal_client(Signals::INCOMING, Signals::empty());
            *incoming = false;
        }
    }

    fn unregister_incoming(&self) {
        if let Some(entry) = self.entry.lock().take() {
            self.base.queue().unregister(entry);
        }
    }

    fn release(&self) {
        if !self.base.dec_ref() {
            return;
        }
        self.unregister_incoming();
        for handle in [&self.local, &self.peer] {
            if let Err(err) = handle.close() {
                error!(koid = self.koid, error = %err, "datagram handle close failed");
                panic!("datagram bridge {}: handle close failed: {err}", self.koid);
            }
        }
        self.registry.remove(self.koid);
        self.base.close_endpoint();
        debug!(koid = self.koid, "datagram bridge released");
    }
}

impl fmt::Debug for DatagramBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramBridge")
            .field("koid", &self.koid)
            .field("transport", &self.base.transport())
            .field("incoming", &*self.incoming.lock())
            .finish()
    }
}

/// 数据报套接字的一个客户端连接。
///
/// # 教案式说明
/// - **意图 (Why)**：与 [`StreamSocket`](crate::stream::StreamSocket) 相同的引用计数模型，
///   但关闭是同步的：没有后台任务需要等待；
/// - **契约 (What)**：
///   - `recv_msg` 每次最多从端点读取一个报文，`peek` 时报文保留供下次读取；
///   - `send_msg` 在端点等待链路地址解析时挂起，解析结束后重试；
///   - 硬错误写入缓存后，端点报告的关闭类错误被替换为缓存值。
pub struct DatagramSocket {
    bridge: Arc<DatagramBridge>,
    closed: bool,
}

impl DatagramSocket {
    pub(crate) fn attach(bridge: Arc<DatagramBridge>) -> Self {
        bridge.base.inc_ref();
        Self {
            bridge,
            closed: false,
        }
    }

    pub fn bridge(&self) -> &Arc<DatagramBridge> {
        &self.bridge
    }

    pub fn koid(&self) -> Koid {
        self.bridge.koid
    }

    pub fn bind(&self, addr: &FullAddress) -> Result<(), SocketError> {
        self.bridge.base.bind(addr)
    }

    pub fn connect(&self, addr: &FullAddress) -> Result<(), SocketError> {
        self.bridge.base.connect(addr)
    }

    pub fn disconnect(&self) -> Result<(), SocketError> {
        self.bridge.base.disconnect()
    }

    pub fn get_sock_name(&self) -> Result<SocketAddr, SocketError> {
        self.bridge.base.get_sock_name()
    }

    pub fn get_peer_name(&self) -> Result<SocketAddr, SocketError> {
        self.bridge.base.get_peer_name()
    }

    pub fn get_sock_opt(&self, name: SocketOptionName) -> Result<SocketOption, SocketError> {
        self.bridge.base.get_sock_opt(name)
    }

    pub fn set_sock_opt(&self, option: SocketOption) -> Result<(), SocketError> {
        self.bridge.base.set_sock_opt(option)
    }

    /// 接收一个报文。
    pub fn recv_msg(
        &self,
        want_addr: bool,
        data_len: usize,
        peek: bool,
    ) -> Result<RecvMsgResponse, SocketError> {
        let bridge = &self.bridge;
        let (result, buffered) = {
            let mut pending = bridge.pending.lock();
            let result = match pending.take() {
                Some(packet) => Ok(packet),
                None => {
                    let mut sender = FullAddress::default();
                    let (result, hard) = bridge
                        .base
                        .with_hard_error(|endpoint| endpoint.read(Some(&mut sender)));
                    result
                        .map(|payload| (payload, sender))
                        .map_err(|err| BaseSocket::prefer_hard_error(err, hard))
                }
            };
            if peek && let Ok(packet) = &result {
                *pending = Some(packet.clone());
            }
            (result, pending.is_some())
        };
        if result.is_ok() {
            bridge.clear_incoming(buffered);
        }

        let (mut data, sender) = result?;
        let mut truncated = 0;
        if data.len() > data_len {
            truncated = data.len() - data_len;
            data.truncate(data_len);
        }
        Ok(RecvMsgResponse {
            addr: want_addr.then(|| sender.to_socket_addr(bridge.base.network())),
            data,
            truncated,
        })
    }

    /// 发送一个报文，返回端点接受的字节数。
    pub async fn send_msg(
        &self,
        addr: Option<&FullAddress>,
        data: &[u8],
    ) -> Result<usize, SocketError> {
        let base = &self.bridge.base;
        let mut options = WriteOptions::default();
        if let Some(addr) = addr {
            if base.network() == NetworkProtocol::Ipv4 && matches!(addr.addr, Some(IpAddr::V6(_)))
            {
                return Err(TransportError::AddressFamilyNotSupported.into());
            }
            options.to = Some(*addr);
        }

        loop {
            let (result, hard) = base.with_hard_error(|endpoint| endpoint.write(data, &options));
            match result {
                Ok(written) => return Ok(written),
                Err(WriteError::Resolving(resolution)) => resolution.resolved().await,
                Err(WriteError::Failed(err)) => {
                    return Err(BaseSocket::prefer_hard_error(err, hard).into());
                }
            }
        }
    }

    /// 关闭读、写或双向；空集合返回 `EINVAL`。
    pub fn shutdown(&self, mode: ShutdownMode) -> Result<(), SocketError> {
        if mode.is_empty() {
            return Err(Errno::Einval.into());
        }
        let bridge = &self.bridge;
        bridge.base.endpoint().shutdown(mode)?;

        let mut signals = Signals::empty();
        if mode.contains(ShutdownMode::READ) {
            bridge.unregister_incoming();
            signals |= Signals::SHUTDOWN_READ;
        }
        if mode.contains(ShutdownMode::WRITE) {
            signals |= Signals::SHUTDOWN_WRITE;
        }
        bridge.local.signal_peer(Signals::empty(), signals)?;
        debug!(koid = bridge.koid, ?mode, "shutdown");
        Ok(())
    }

    /// 返回客户端事件句柄的一个副本。
    pub fn describe(&self) -> Result<Handle, SocketError> {
        let handle = self.bridge.peer.duplicate()?;
        debug!(koid = self.bridge.koid, "describe");
        Ok(handle)
    }

    pub fn clone_socket(&self) -> DatagramSocket {
        debug!(koid = self.bridge.koid, "clone");
        DatagramSocket::attach(Arc::clone(&self.bridge))
    }

    /// 关闭本连接；最后一个连接关闭时同步释放全部资源。
    pub fn close(mut self) {
        self.closed = true;
        debug!(koid = self.bridge.koid, "close");
        self.bridge.release();
    }
}

impl Drop for DatagramSocket {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            self.bridge.release();
        }
    }
}

impl fmt::Debug for DatagramSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramSocket")
            .field("bridge", &self.bridge)
            .finish()
    }
}
