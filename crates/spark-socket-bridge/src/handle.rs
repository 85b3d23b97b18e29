//! # handle 模块说明
//!
//! ## 角色定位（Why）
//! - 提供桥接层面向客户端的一侧：一对互联的内核句柄（socket pair）或事件对（event pair），
//!   支持非阻塞读写与异步就绪信号；
//! - 客户端持有 `peer` 端，桥接持有 `local` 端，两端之间的数据与信号语义与 Zircon socket 对齐。
//!
//! ## 信号模型（What）
//! - 内核位（只读，由对象状态推导）：`READABLE`、`WRITABLE`、`PEER_CLOSED`、
//!   `WRITE_DISABLED`、`PEER_WRITE_DISABLED`；
//! - 用户位（`USER_MASK` 内）：由持有者通过 [`Handle::signal`] / [`Handle::signal_peer`] 设置，
//!   桥接约定的含义见 [`Signals::INCOMING`] 等常量；
//! - `shutdown(WRITE)` 关闭本端写方向；`shutdown(READ)` 关闭对端写方向，二者都会令读端在队列
//!   耗尽后得到 [`HandleError::BadState`]。
//!
//! ## 实现策略（How）
//! - 两端共享一个 `PairObject`：数据与关闭状态受 `parking_lot::Mutex` 保护，每个端点的信号通过
//!   `tokio::sync::watch` 发布；任何状态变更都在锁内重新推导内核位，保证信号与数据一致；
//! - 句柄不实现 `Clone`，复制必须显式调用 [`Handle::duplicate`]，每个端点记录存活句柄数，
//!   计数归零时该端关闭，对端观测到 `PEER_CLOSED`。

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bitflags::bitflags;
use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::HandleError;

/// 内核对象标识。
pub type Koid = u64;

static NEXT_KOID: AtomicU64 = AtomicU64::new(1);

fn next_koid() -> Koid {
    NEXT_KOID.fetch_add(1, Ordering::Relaxed)
}

bitflags! {
    /// 句柄就绪信号位。
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct Signals: u32 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const PEER_CLOSED = 1 << 2;
        const PEER_WRITE_DISABLED = 1 << 4;
        const WRITE_DISABLED = 1 << 5;

        const USER_0 = 1 << 24;
        const USER_1 = 1 << 25;
        const USER_2 = 1 << 26;
        const USER_3 = 1 << 27;
        const USER_4 = 1 << 28;
        const USER_5 = 1 << 29;
        const USER_6 = 1 << 30;
        const USER_7 = 1 << 31;

        /// 监听套接字上有待接受的连接，或数据报端点有待读取的报文。
        const INCOMING = Self::USER_0.bits();
        /// 端点已可发送（连接状态已确定）。
        const OUTGOING = Self::USER_1.bits();
        /// 连接已建立。
        const CONNECTED = Self::USER_3.bits();
        /// 数据报套接字读方向已关闭。
        const SHUTDOWN_READ = Self::USER_4.bits();
        /// 数据报套接字写方向已关闭。
        const SHUTDOWN_WRITE = Self::USER_5.bits();
        /// 桥接内部：`local` 端正在拆除，唤醒所有等待中的循环。
        const CLOSING = Self::USER_7.bits();
    }
}

impl Signals {
    /// 可由持有者修改的用户信号位。
    pub const USER_MASK: Signals = Signals::from_bits_truncate(0xff00_0000);
}

bitflags! {
    /// `shutdown` 的方向集合。
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct ShutdownMode: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// 句柄承载的数据语义。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SocketMode {
    /// 字节流：写入可被部分接受，读取跨越写入边界。
    Stream,
    /// 数据报：每次写入作为整体排队，读取一次取出一个报文。
    Datagram,
}

/// 内核对象种类。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum HandleKind {
    Socket(SocketMode),
    EventPair,
}

#[derive(Default)]
struct Inbound {
    chunks: VecDeque<Bytes>,
    queued: usize,
}

#[derive(Default)]
struct PairState {
    // `inbound[i]` 是端点 i 可读取的数据，即端点 1-i 写入的数据。
    inbound: [Inbound; 2],
    write_disabled: [bool; 2],
    closed: [bool; 2],
    handles: [usize; 2],
}

struct PairObject {
    kind: HandleKind,
    capacity: usize,
    koids: [Koid; 2],
    state: Mutex<PairState>,
    signals: [watch::Sender<Signals>; 2],
}

impl PairObject {
    fn new(kind: HandleKind, capacity: usize) -> Arc<Self> {
        let object = Arc::new(Self {
            kind,
            capacity,
            koids: [next_koid(), next_koid()],
            state: Mutex::new(PairState {
                handles: [1, 1],
                ..PairState::default()
            }),
            signals: [
                watch::Sender::new(Signals::empty()),
                watch::Sender::new(Signals::empty()),
            ],
        });
        object.publish(&object.state.lock());
        object
    }

    fn derived(&self, state: &PairState, side: usize) -> Signals {
        let peer = 1 - side;
        let mut signals = Signals::empty();
        if state.closed[peer] {
            signals |= Signals::PEER_CLOSED;
        }
        if let HandleKind::Socket(_) = self.kind {
            if !state.inbound[side].chunks.is_empty() {
                signals |= Signals::READABLE;
            }
            if !state.write_disabled[side]
                && !state.closed[peer]
                && state.inbound[peer].queued < self.capacity
            {
                signals |= Signals::WRITABLE;
            }
            if state.write_disabled[side] {
                signals |= Signals::WRITE_DISABLED;
            }
            if state.write_disabled[peer] {
                signals |= Signals::PEER_WRITE_DISABLED;
            }
        }
        signals
    }

    /// 在持有状态锁时重新推导两端的内核信号位，用户位保持不变。
    fn publish(&self, state: &PairState) {
        for side in 0..2 {
            let derived = self.derived(state, side);
            self.signals[side].send_if_modified(|current| {
                let next = (*current & Signals::USER_MASK) | derived;
                if next == *current {
                    false
                } else {
                    *current = next;
                    true
                }
            });
        }
    }

    fn update_user(&self, side: usize, clear: Signals, set: Signals) {
        self.signals[side].send_if_modified(|current| {
            let next = (*current - clear) | set;
            if next == *current {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

/// 内核句柄：socket pair 或 event pair 的一端。
///
/// # 教案式说明
/// - **意图 (Why)**：为桥接提供与内核对象等价的非阻塞读写、半关闭与信号等待能力，
///   使桥接逻辑可以在纯用户态下被完整测试；
/// - **契约 (What)**：
///   - 所有操作非阻塞，唯一的挂起点是 [`wait`](Self::wait)；
///   - [`close`](Self::close) 至多成功一次，之后任何操作返回 [`HandleError::BadHandle`]；
///   - 未显式关闭的句柄在 `Drop` 时自动关闭；
/// - **风险 (Trade-offs)**：等待基于 `watch` 的最新值，若信号在等待者订阅前后快速置位又清除，
///   等待者可能错过这次跳变；桥接中被等待的信号都是单调或由等待者自身清除的，不受影响。
pub struct Handle {
    object: Arc<PairObject>,
    side: usize,
    released: AtomicBool,
}

impl Handle {
    fn pair(object: Arc<PairObject>) -> (Handle, Handle) {
        (
            Handle {
                object: Arc::clone(&object),
                side: 0,
                released: AtomicBool::new(false),
            },
            Handle {
                object,
                side: 1,
                released: AtomicBool::new(false),
            },
        )
    }

    /// 创建一对互联的 socket 句柄，`capacity` 为每个方向可排队的最大字节数。
    pub fn socket_pair(mode: SocketMode, capacity: usize) -> (Handle, Handle) {
        Self::pair(PairObject::new(HandleKind::Socket(mode), capacity))
    }

    /// 创建一对仅承载信号的事件句柄。
    pub fn event_pair() -> (Handle, Handle) {
        Self::pair(PairObject::new(HandleKind::EventPair, 0))
    }

    pub fn koid(&self) -> Koid {
        self.object.koids[self.side]
    }

    pub fn kind(&self) -> HandleKind {
        self.object.kind
    }

    fn live(&self) -> Result<&PairObject, HandleError> {
        if self.released.load(Ordering::Acquire) {
            Err(HandleError::BadHandle)
        } else {
            Ok(&self.object)
        }
    }

    fn socket_mode(&self) -> Result<SocketMode, HandleError> {
        match self.live()?.kind {
            HandleKind::Socket(mode) => Ok(mode),
            HandleKind::EventPair => Err(HandleError::NotSupported),
        }
    }

    /// 读取对端写入的数据。
    ///
    /// - 字节流模式尽可能填满 `buf`；数据报模式取出一个报文，超出 `buf` 的部分被丢弃；
    /// - 队列为空时：对端写方向已关闭返回 `BadState`，对端已关闭返回 `PeerClosed`，
    ///   否则返回 `ShouldWait`。
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, HandleError> {
        let mode = self.socket_mode()?;
        let object = &self.object;
        let (side, peer) = (self.side, 1 - self.side);
        let mut guard = object.state.lock();
        let state = &mut *guard;

        if state.inbound[side].chunks.is_empty() {
            return Err(if state.write_disabled[peer] {
                HandleError::BadState
            } else if state.closed[peer] {
                HandleError::PeerClosed
            } else {
                HandleError::ShouldWait
            });
        }

        let inbound = &mut state.inbound[side];
        let copied = match mode {
            SocketMode::Stream => {
                let mut copied = 0;
                while copied < buf.len() {
                    let Some(front) = inbound.chunks.front_mut() else {
                        break;
                    };
                    let n = front.len().min(buf.len() - copied);
                    buf[copied..copied + n].copy_from_slice(&front[..n]);
                    front.advance(n);
                    copied += n;
                    if front.is_empty() {
                        inbound.chunks.pop_front();
                    }
                }
                inbound.queued -= copied;
                copied
            }
            SocketMode::Datagram => match inbound.chunks.pop_front() {
                Some(message) => {
                    inbound.queued -= message.len();
                    let n = message.len().min(buf.len());
                    buf[..n].copy_from_slice(&message[..n]);
                    n
                }
                None => 0,
            },
        };
        object.publish(state);
        Ok(copied)
    }

    /// 向对端写入数据。
    ///
    /// - 字节流模式按剩余容量部分接受，返回实际写入字节数；
    /// - 数据报模式整体接受或返回 `ShouldWait`，超过容量的报文返回 `OutOfRange`。
    pub fn write(&self, data: &[u8]) -> Result<usize, HandleError> {
        let mode = self.socket_mode()?;
        let object = &self.object;
        let (side, peer) = (self.side, 1 - self.side);
        let mut guard = object.state.lock();
        let state = &mut *guard;

        if state.write_disabled[side] {
            return Err(HandleError::BadState);
        }
        if state.closed[peer] {
            return Err(HandleError::PeerClosed);
        }

        let capacity = object.capacity;
        let inbound = &mut state.inbound[peer];
        let written = match mode {
            SocketMode::Stream => {
                if data.is_empty() {
                    return Ok(0);
                }
                let room = capacity.saturating_sub(inbound.queued);
                if room == 0 {
                    return Err(HandleError::ShouldWait);
                }
                let n = room.min(data.len());
                inbound.chunks.push_back(Bytes::copy_from_slice(&data[..n]));
                inbound.queued += n;
                n
            }
            SocketMode::Datagram => {
                if data.len() > capacity {
                    return Err(HandleError::OutOfRange);
                }
                if inbound.queued + data.len() > capacity {
                    return Err(HandleError::ShouldWait);
                }
                inbound.chunks.push_back(Bytes::copy_from_slice(data));
                inbound.queued += data.len();
                data.len()
            }
        };
        object.publish(state);
        Ok(written)
    }

    /// 关闭一个或两个方向。
    pub fn shutdown(&self, mode: ShutdownMode) -> Result<(), HandleError> {
        self.socket_mode()?;
        let object = &self.object;
        let (side, peer) = (self.side, 1 - self.side);
        let mut state = object.state.lock();
        if mode.contains(ShutdownMode::WRITE) {
            state.write_disabled[side] = true;
        }
        if mode.contains(ShutdownMode::READ) {
            state.write_disabled[peer] = true;
        }
        object.publish(&state);
        Ok(())
    }

    /// 修改本端的用户信号位。
    pub fn signal(&self, clear: Signals, set: Signals) -> Result<(), HandleError> {
        let object = self.live()?;
        if !Signals::USER_MASK.contains(clear | set) {
            return Err(HandleError::InvalidArgs);
        }
        object.update_user(self.side, clear, set);
        Ok(())
    }

    /// 修改对端的用户信号位；对端已关闭时返回 `PeerClosed`。
    pub fn signal_peer(&self, clear: Signals, set: Signals) -> Result<(), HandleError> {
        let object = self.live()?;
        if !Signals::USER_MASK.contains(clear | set) {
            return Err(HandleError::InvalidArgs);
        }
        let peer = 1 - self.side;
        let state = object.state.lock();
        if state.closed[peer] {
            return Err(HandleError::PeerClosed);
        }
        object.update_user(peer, clear, set);
        Ok(())
    }

    /// 当前信号快照。
    pub fn signals(&self) -> Signals {
        *self.object.signals[self.side].borrow()
    }

    /// 等待 `mask` 中任一信号置位，返回置位时的完整信号集合。
    ///
    /// `timeout` 为 `None` 时无限等待，超时返回 [`HandleError::TimedOut`]。
    pub async fn wait(
        &self,
        mask: Signals,
        timeout: Option<Duration>,
    ) -> Result<Signals, HandleError> {
        let mut rx = self.live()?.signals[self.side].subscribe();
        let observe = async move {
            match rx.wait_for(|current| current.intersects(mask)).await {
                Ok(current) => Ok(*current),
                Err(_) => Err(HandleError::BadHandle),
            }
        };
        match timeout {
            None => observe.await,
            Some(limit) => tokio::time::timeout(limit, observe)
                .await
                .map_err(|_| HandleError::TimedOut)?,
        }
    }

    /// 复制句柄，新句柄指向同一端点并独立计数。
    pub fn duplicate(&self) -> Result<Handle, HandleError> {
        let object = self.live()?;
        object.state.lock().handles[self.side] += 1;
        Ok(Handle {
            object: Arc::clone(&self.object),
            side: self.side,
            released: AtomicBool::new(false),
        })
    }

    /// 释放句柄；端点的最后一个句柄释放时该端关闭，未读数据被丢弃。
    pub fn close(&self) -> Result<(), HandleError> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Err(HandleError::BadHandle);
        }
        let object = &self.object;
        let side = self.side;
        let mut state = object.state.lock();
        state.handles[side] -= 1;
        if state.handles[side] == 0 {
            state.closed[side] = true;
            state.inbound[side] = Inbound::default();
            object.publish(&state);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if !self.is_closed() {
            let _ = self.close();
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("koid", &self.koid())
            .field("kind", &self.kind())
            .field("released", &self.is_closed())
            .finish()
    }
}
