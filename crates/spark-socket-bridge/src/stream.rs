//! # stream 模块说明
//!
//! ## 角色定位（Why）
//! - 把一个协议栈端点桥接到一对内核 socket 句柄上：客户端在 `peer` 端读写，
//!   桥接在 `local` 端与端点之间搬运字节并传播半关闭、全关闭与错误；
//! - 同时实现面向客户端连接的操作集 [`StreamSocket`]（bind/connect/listen/accept/close ...）。
//!
//! ## 任务拓扑（How）
//! - 每个桥接运行三个任务：
//!   1. **poller**：等待 `local` 上的 `WRITE_DISABLED`（客户端关闭读方向）并对端点执行
//!      `Shutdown(READ)`，观测到 `CLOSING` 后退出；
//!   2. **read loop**：端点 → `local`，同时维护连接状态机并向客户端发布
//!      `OUTGOING` / `CONNECTED` / `INCOMING`；
//!   3. **write loop**：`local` → 端点，端点阻塞时等待 `OUT` 事件或 linger 截止；
//! - 构造在 read loop 注册好 `IN` 通知并确定初始连接状态之后才返回（构造屏障），
//!   保证构造返回后到达的入站事件不会丢失；
//! - 拆除（teardown）由 `teardown_started` 闩锁保证只执行一次：触发 `closing`、在 `local` 上
//!   置位 `CLOSING`、等待三个任务退出，再依次释放句柄、注销 HUP、移出登记表、关闭端点；
//! - 每个任务由 `LoopGuard` 包裹：任务正常退出或 panic 展开时都会注销通知条目并触发完成闩锁，
//!   因此拆除不会因某个任务 panic 而永久挂起；panic 在拆除完成后由拆除方重新抛出。
//!
//! ## 风险提示（Trade-offs）
//! - linger 关闭时以端点的 `TcpLinger2` 作为写循环排空的截止时间，实际 TCP linger 时长最多可达
//!   配置值的两倍；
//! - 端点返回与约定不符的结果（例如已连接端点报告 `NotConnected`）视为不变量被破坏，记录日志后 panic。

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::address::FullAddress;
use crate::base::BaseSocket;
use crate::config::BridgeConfig;
use crate::endpoint::{
    LingerOption, SocketOption, SocketOptionName, StackEndpoint, WriteError, WriteOptions,
};
use crate::error::{Errno, HandleError, SocketError, TransportError};
use crate::handle::{Handle, Koid, ShutdownMode, Signals, SocketMode};
use crate::latch::Latch;
use crate::registry::SocketRegistry;
use crate::waiter::{EntryId, EventMask, WaitQueue};

/// 桥接任务的退出方式。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum LoopExit {
    Normal,
    /// 观测到不可恢复的端点错误，退出后发起拆除。
    TriggerClose,
}

/// 持有一个事件队列条目，释放时注销。
struct Registration {
    queue: Arc<WaitQueue>,
    entry: EntryId,
}

impl Registration {
    fn channel(queue: &Arc<WaitQueue>, mask: EventMask) -> (Registration, mpsc::Receiver<()>) {
        let (entry, rx) = queue.register_channel(mask);
        let registration = Registration {
            queue: Arc::clone(queue),
            entry,
        };
        (registration, rx)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.queue.unregister(self.entry);
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum LoopTask {
    Poller,
    Reader,
    Writer,
}

impl LoopTask {
    fn name(self) -> &'static str {
        match self {
            LoopTask::Poller => "poller",
            LoopTask::Reader => "reader",
            LoopTask::Writer => "writer",
        }
    }
}

/// 桥接任务的退出守卫。
///
/// tokio 在任务 panic 后会丢弃其 future，守卫随之析构：先注销任务的通知条目，
/// 再触发对应的完成闩锁。panic 展开中析构时记录到 `aborted`，由拆除方在释放资源后重新抛出。
struct LoopGuard {
    bridge: Arc<StreamBridge>,
    task: LoopTask,
    registration: Option<Registration>,
}

impl LoopGuard {
    fn new(bridge: &Arc<StreamBridge>, task: LoopTask, registration: Option<Registration>) -> Self {
        Self {
            bridge: Arc::clone(bridge),
            task,
            registration,
        }
    }
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        drop(self.registration.take());
        let bridge = &self.bridge;
        if std::thread::panicking() {
            error!(koid = bridge.koid, task = self.task.name(), "bridge task panicked");
            let mut aborted = bridge.aborted.lock();
            if aborted.is_none() {
                *aborted = Some(self.task.name());
            }
        }
        let done = match self.task {
            LoopTask::Poller => &bridge.poll_done,
            LoopTask::Reader => &bridge.read_done,
            LoopTask::Writer => &bridge.write_done,
        };
        done.fire();
    }
}

/// 等待通道条目的下一次通知；条目已注销（`None`）时永不完成。
async fn notified(rx: &mut Option<mpsc::Receiver<()>>) {
    match rx {
        Some(rx) => {
            if rx.recv().await.is_none() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

/// 字节流桥接。
///
/// # 教案式说明
/// - **意图 (Why)**：以三个协作任务替代“每连接一个阻塞线程”，所有挂起点都是显式的信号/闩锁等待，
///   取消通过 `closing` 闩锁与 `CLOSING` 用户信号协作完成；
/// - **契约 (What)**：
///   - 由 [`StreamBridge::start`] 构造，返回时三个任务均已启动且初始连接状态已发布；
///   - [`teardown`](Self::teardown) 可被任意多个调用方并发调用，副作用恰好发生一次，
///     迟到的调用方等待 `released` 后返回；
///   - 引用计数归零且三个任务全部退出后，桥接持有的资源才会被释放；
/// - **风险 (Trade-offs)**：HUP 回调在事件队列锁内执行，只能派生拆除任务，不能就地等待。
pub struct StreamBridge {
    base: BaseSocket,
    koid: Koid,
    local: Handle,
    peer: Handle,
    closing: Latch,
    read_done: Latch,
    write_done: Latch,
    poll_done: Latch,
    linger_gate: Latch,
    teardown_started: Latch,
    released: Latch,
    /// 第一个 panic 退出的任务。
    aborted: Mutex<Option<&'static str>>,
    incoming: Mutex<bool>,
    hup_entry: OnceLock<EntryId>,
    registry: Arc<SocketRegistry>,
    config: Arc<BridgeConfig>,
    runtime: tokio::runtime::Handle,
}

impl StreamBridge {
    /// 创建桥接并启动其任务。
    ///
    /// 必须在 tokio 运行时内调用；HUP 回调与延迟关闭都派生到当前运行时。
    pub(crate) async fn start(
        base: BaseSocket,
        registry: Arc<SocketRegistry>,
        config: Arc<BridgeConfig>,
    ) -> Arc<StreamBridge> {
        let mode = if base.transport().is_stream() {
            SocketMode::Stream
        } else {
            SocketMode::Datagram
        };
        let (local, peer) = Handle::socket_pair(mode, config.handle_capacity);
        let bridge = Arc::new(StreamBridge {
            koid: local.koid(),
            base,
            local,
            peer,
            closing: Latch::new(),
            read_done: Latch::new(),
            write_done: Latch::new(),
            poll_done: Latch::new(),
            linger_gate: Latch::new(),
            teardown_started: Latch::new(),
            released: Latch::new(),
            aborted: Mutex::new(None),
            incoming: Mutex::new(false),
            hup_entry: OnceLock::new(),
            registry,
            config,
            runtime: tokio::runtime::Handle::current(),
        });

        // HUP 可能在注册后立即触发并移除登记项，因此先登记。
        bridge
            .registry
            .add(bridge.koid, Arc::clone(bridge.base.endpoint()));

        let weak = Arc::downgrade(&bridge);
        let runtime = bridge.runtime.clone();
        let entry = bridge.base.queue().register(EventMask::HUP, move |_| {
            if let Some(bridge) = weak.upgrade() {
                runtime.spawn(async move { bridge.teardown().await });
            }
        });
        let _ = bridge.hup_entry.set(entry);

        let guard = LoopGuard::new(&bridge, LoopTask::Poller, None);
        tokio::spawn(async move {
            guard.bridge.poll_loop().await;
        });

        let (init_tx, init_rx) = oneshot::channel();
        let (in_entry, in_rx) = Registration::channel(bridge.base.queue(), EventMask::IN);
        let guard = LoopGuard::new(&bridge, LoopTask::Reader, Some(in_entry));
        tokio::spawn(async move {
            let reader = Arc::clone(&guard.bridge);
            let exit = reader.read_loop(in_rx, init_tx).await;
            drop(guard);
            if exit == LoopExit::TriggerClose {
                reader.teardown().await;
            }
        });
        // 发送端只会在初始连接状态确定后触发，或随读循环提前退出而被丢弃。
        let _ = init_rx.await;

        let (out_entry, out_rx) = Registration::channel(bridge.base.queue(), EventMask::OUT);
        let guard = LoopGuard::new(&bridge, LoopTask::Writer, Some(out_entry));
        tokio::spawn(async move {
            let writer = Arc::clone(&guard.bridge);
            let exit = writer.write_loop(out_rx).await;
            drop(guard);
            if exit == LoopExit::TriggerClose {
                writer.teardown().await;
            }
        });

        debug!(koid = bridge.koid, transport = ?bridge.base.transport(), "stream bridge started");
        bridge
    }

    pub fn koid(&self) -> Koid {
        self.koid
    }

    pub fn base(&self) -> &BaseSocket {
        &self.base
    }

    fn fatal(&self, what: fmt::Arguments<'_>) -> ! {
        error!(koid = self.koid, "{what}");
        panic!("stream bridge {}: {what}", self.koid)
    }

    fn shutdown_local(&self, mode: ShutdownMode) {
        if let Err(err) = self.local.shutdown(mode) {
            self.fatal(format_args!("local shutdown({mode:?}) failed: {err}"));
        }
    }

    fn signal_client(&self, clear: Signals, set: Signals) {
        if let Err(err) = self.local.signal_peer(clear, set) {
            self.fatal(format_args!("signal peer {set:?} failed: {err}"));
        }
    }

    /// 在端点确有待处理的入站连接时置位 `INCOMING`。
    fn assert_incoming(&self) {
        let mut incoming = self.incoming.lock();
        if !*incoming && !self.base.endpoint().readiness(EventMask::IN).is_empty() {
            self.signal_client(Signals::empty(), Signals::INCOMING);
            *incoming = true;
        }
    }

    async fn poll_loop(&self) {
        let mut mask = Signals::WRITE_DISABLED | Signals::CLOSING;
        loop {
            let observed = match self.local.wait(mask, None).await {
                Ok(observed) => observed,
                Err(err) => self.fatal(format_args!("poller wait failed: {err}")),
            };
            if (observed & mask).contains(Signals::WRITE_DISABLED) {
                mask.remove(Signals::WRITE_DISABLED);
                match self.base.endpoint().shutdown(ShutdownMode::READ) {
                    Ok(()) | Err(TransportError::NotConnected) => {}
                    Err(err) => self.fatal(format_args!("endpoint shutdown(READ) failed: {err}")),
                }
            }
            if observed.contains(Signals::CLOSING) {
                return;
            }
        }
    }

    async fn read_loop(
        &self,
        in_rx: mpsc::Receiver<()>,
        init: oneshot::Sender<()>,
    ) -> LoopExit {
        let stream = self.base.transport().is_stream();
        let mut connected = !stream;
        let mut init = Some(init);
        let mut in_rx = Some(in_rx);
        let (mut out_entry, mut out_rx) = if connected {
            (None, None)
        } else {
            let (entry, rx) = Registration::channel(self.base.queue(), EventMask::OUT);
            (Some(entry), Some(rx))
        };
        let release_init = |init: &mut Option<oneshot::Sender<()>>| {
            if let Some(tx) = init.take() {
                let _ = tx.send(());
            }
        };

        let exit = 'outer: loop {
            let payload: Bytes = loop {
                let (result, hard) = self.base.with_hard_error(|endpoint| endpoint.read(None));

                if matches!(result, Err(TransportError::NotConnected)) {
                    if connected {
                        self.fatal(format_args!("connected endpoint reported NotConnected on read"));
                    }
                    release_init(&mut init);
                    tokio::select! {
                        biased;
                        _ = self.closing.fired() => break 'outer LoopExit::Normal,
                        _ = notified(&mut in_rx) => {
                            // 未连接时的入站事件只可能来自监听端点的新连接。
                            self.assert_incoming();
                            continue;
                        }
                        _ = notified(&mut out_rx) => continue,
                    }
                } else if !connected {
                    let mut signals = Signals::OUTGOING;
                    if matches!(
                        result,
                        Ok(_)
                            | Err(TransportError::WouldBlock)
                            | Err(TransportError::ClosedForReceive)
                    ) {
                        connected = true;
                        out_entry = None;
                        out_rx = None;
                        signals |= Signals::CONNECTED;
                    }
                    self.signal_client(Signals::empty(), signals);
                }
                release_init(&mut init);

                match result {
                    Ok(payload) => break payload,
                    Err(TransportError::NoLinkAddress) if connected => {
                        self.fatal(format_args!("link address failure on a connected endpoint"))
                    }
                    // 连接建立后超时等同于收到 RST。
                    Err(TransportError::Timeout) if connected => break 'outer LoopExit::TriggerClose,
                    // 连接从未建立：视为被拒绝；客户端可以再次 connect。
                    Err(
                        TransportError::NoLinkAddress
                        | TransportError::Timeout
                        | TransportError::ConnectionRefused,
                    ) => {
                        tokio::select! {
                            biased;
                            _ = self.closing.fired() => break 'outer LoopExit::Normal,
                            _ = notified(&mut out_rx) => continue,
                        }
                    }
                    Err(TransportError::WouldBlock) => {
                        tokio::select! {
                            biased;
                            _ = self.closing.fired() => break 'outer LoopExit::Normal,
                            _ = notified(&mut in_rx) => continue,
                        }
                    }
                    Err(TransportError::ClosedForReceive) => {
                        // 处于错误状态的端点同样报告 ClosedForReceive，此时交给拆除流程。
                        if hard.is_none() {
                            self.shutdown_local(ShutdownMode::WRITE);
                        }
                        break 'outer LoopExit::Normal;
                    }
                    Err(
                        TransportError::ConnectionAborted
                        | TransportError::ConnectionReset
                        | TransportError::NetworkUnreachable
                        | TransportError::NoRoute,
                    ) => break 'outer LoopExit::TriggerClose,
                    Err(err) => {
                        error!(koid = self.koid, error = %err, "endpoint read failed");
                        tokio::select! {
                            biased;
                            _ = self.closing.fired() => break 'outer LoopExit::Normal,
                            _ = notified(&mut in_rx) => continue,
                        }
                    }
                }
            };

            let mut pending: &[u8] = &payload;
            loop {
                match self.local.write(pending) {
                    Ok(written) => {
                        if !stream && written < pending.len() {
                            self.fatal(format_args!(
                                "short datagram write to local handle: {written}/{}",
                                pending.len()
                            ));
                        }
                        pending = &pending[written..];
                        if pending.is_empty() {
                            break;
                        }
                    }
                    Err(HandleError::BadState | HandleError::PeerClosed) => {
                        // 客户端关闭了读方向。
                        if let Err(err) = self.base.endpoint().shutdown(ShutdownMode::READ) {
                            // 被对端重置的连接在尚有未读数据时允许读取，但 Shutdown 会返回 NotConnected。
                            if !(connected && err == TransportError::NotConnected) {
                                self.fatal(format_args!("endpoint shutdown(READ) failed: {err}"));
                            }
                            info!(
                                koid = self.koid,
                                pending = pending.len(),
                                "client shut down reading on a reset endpoint with pending data"
                            );
                        }
                        break 'outer LoopExit::Normal;
                    }
                    Err(HandleError::ShouldWait) => {
                        let mask = Signals::WRITABLE | Signals::WRITE_DISABLED | Signals::CLOSING;
                        match self.local.wait(mask, None).await {
                            Ok(observed)
                                if observed
                                    .intersects(Signals::WRITABLE | Signals::WRITE_DISABLED) =>
                            {
                                continue;
                            }
                            Ok(_) => break 'outer LoopExit::Normal,
                            Err(err) => self.fatal(format_args!("read loop wait failed: {err}")),
                        }
                    }
                    Err(err) => self.fatal(format_args!("local write failed: {err}")),
                }
            }
            self.base.endpoint().moderate_recv_buf(payload.len());
        };

        drop(out_entry);
        exit
    }

    async fn write_loop(&self, out_rx: mpsc::Receiver<()>) -> LoopExit {
        let stream = self.base.transport().is_stream();
        let chunk = if stream {
            self.config.stream_write_chunk
        } else {
            self.config.datagram_write_chunk
        };
        let mut out_rx = Some(out_rx);
        let mut buf = vec![0u8; chunk];
        let options = WriteOptions::default();

        loop {
            let read = match self.local.read(&mut buf) {
                Ok(read) => read,
                Err(HandleError::BadState | HandleError::PeerClosed) => {
                    // 客户端关闭了写方向。
                    match self.base.endpoint().shutdown(ShutdownMode::WRITE) {
                        Ok(()) | Err(TransportError::NotConnected) => {}
                        Err(err) => {
                            self.fatal(format_args!("endpoint shutdown(WRITE) failed: {err}"))
                        }
                    }
                    return LoopExit::Normal;
                }
                Err(HandleError::ShouldWait) => {
                    let mask =
                        Signals::READABLE | Signals::PEER_WRITE_DISABLED | Signals::CLOSING;
                    match self.local.wait(mask, None).await {
                        // 即使同时观测到 CLOSING 也先读：客户端可能写完数据后立即关闭。
                        Ok(observed)
                            if observed
                                .intersects(Signals::READABLE | Signals::PEER_WRITE_DISABLED) =>
                        {
                            continue;
                        }
                        Ok(_) => return LoopExit::Normal,
                        Err(err) => self.fatal(format_args!("write loop wait failed: {err}")),
                    }
                }
                Err(err) => self.fatal(format_args!("local read failed: {err}")),
            };

            let mut pending = &buf[..read];
            loop {
                let (result, hard) = self
                    .base
                    .with_hard_error(|endpoint| endpoint.write(pending, &options));
                match result {
                    Err(WriteError::Resolving(resolution)) => {
                        if stream {
                            self.fatal(format_args!(
                                "stream endpoints resolve link addresses on connect"
                            ));
                        }
                        resolution.resolved().await;
                        continue;
                    }
                    Ok(written) => {
                        if !stream && written < pending.len() {
                            self.fatal(format_args!(
                                "short datagram write to endpoint: {written}/{}",
                                pending.len()
                            ));
                        }
                        pending = &pending[written..];
                        if !pending.is_empty() {
                            continue;
                        }
                    }
                    Err(WriteError::Failed(TransportError::WouldBlock)) => {
                        if !stream {
                            self.fatal(format_args!("datagram endpoint writes never block"));
                        }
                        // 不能在这里等待 closing：客户端可能写入数据后立即关闭，数据须在 linger 内排空。
                        tokio::select! {
                            biased;
                            _ = self.linger_gate.fired() => return LoopExit::Normal,
                            _ = notified(&mut out_rx) => continue,
                        }
                    }
                    Err(WriteError::Failed(TransportError::ClosedForSend)) => {
                        if hard.is_none() {
                            self.shutdown_local(ShutdownMode::READ);
                        }
                        return LoopExit::Normal;
                    }
                    Err(WriteError::Failed(
                        TransportError::ConnectionAborted
                        | TransportError::ConnectionReset
                        | TransportError::NetworkUnreachable
                        | TransportError::NoRoute
                        | TransportError::Timeout,
                    )) => return LoopExit::TriggerClose,
                    Err(WriteError::Failed(err)) => {
                        error!(
                            koid = self.koid,
                            error = %err,
                            dropped = pending.len(),
                            "endpoint write failed"
                        );
                    }
                }
                break;
            }
        }
    }

    /// 拆除桥接并释放资源。
    ///
    /// 若某个桥接任务曾 panic，资源照常释放，随后本调用以 panic 形式上报。
    pub async fn teardown(&self) {
        self.shut_down().await;
        self.propagate_task_panic();
    }

    async fn shut_down(&self) {
        if !self.teardown_started.fire() {
            self.released.fired().await;
            return;
        }

        self.closing.fire();
        if let Err(err) = self.local.signal(Signals::empty(), Signals::CLOSING) {
            self.fatal(format_args!("failed to raise CLOSING: {err}"));
        }

        self.read_done.fired().await;
        self.write_done.fired().await;
        self.poll_done.fired().await;

        if let Err(err) = self.local.close() {
            self.fatal(format_args!("local close failed: {err}"));
        }
        if let Some(entry) = self.hup_entry.get() {
            self.base.queue().unregister(*entry);
        }
        self.registry.remove(self.koid);
        self.base.close_endpoint();

        debug!(koid = self.koid, "stream bridge released");
        self.released.fire();
    }

    fn propagate_task_panic(&self) {
        if let Some(task) = self.aborted.lock().take() {
            panic!("stream bridge {}: {task} task panicked", self.koid);
        }
    }

    /// 等待拆除完成。
    pub async fn released(&self) {
        self.released.fired().await;
    }

    pub fn is_released(&self) -> bool {
        self.released.is_fired()
    }

    fn arm_linger(self: &Arc<Self>, timeout: Duration) {
        let weak = Arc::downgrade(self);
        self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(bridge) = weak.upgrade() {
                bridge.linger_gate.fire();
            }
        });
    }

    async fn teardown_and_release_peer(&self) {
        self.shut_down().await;
        if let Err(err) = self.peer.close() {
            self.fatal(format_args!("peer close failed: {err}"));
        }
        self.propagate_task_panic();
    }
}

impl fmt::Debug for StreamBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamBridge")
            .field("koid", &self.koid)
            .field("transport", &self.base.transport())
            .field("closing", &self.closing.is_fired())
            .field("released", &self.released.is_fired())
            .finish()
    }
}

/// 字节流套接字的一个客户端连接。
///
/// # 教案式说明
/// - **意图 (Why)**：同一个桥接可被多个客户端连接共享（`clone_socket`），连接的生命周期决定
///   桥接的引用计数；
/// - **契约 (What)**：
///   - 每个 `StreamSocket` 持有一个引用计数，[`close`](Self::close) 或 `Drop` 时归还；
///   - 最后一个连接关闭时按 `SO_LINGER` 决定同步还是后台拆除；
///   - 所有操作返回 `Result<T, SocketError>`，协议栈错误已映射为 POSIX 错误码。
pub struct StreamSocket {
    bridge: Arc<StreamBridge>,
    closed: bool,
}

impl StreamSocket {
    pub(crate) fn attach(bridge: Arc<StreamBridge>) -> Self {
        bridge.base.inc_ref();
        Self {
            bridge,
            closed: false,
        }
    }

    pub fn bridge(&self) -> &Arc<StreamBridge> {
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

    /// 开始监听；负的 backlog 按 0 处理。
    pub fn listen(&self, backlog: i16) -> Result<(), SocketError> {
        let backlog = usize::try_from(backlog).unwrap_or(0);
        self.bridge.base.endpoint().listen(backlog)?;
        debug!(koid = self.bridge.koid, backlog, "listen");
        Ok(())
    }

    /// 接受一个入站连接。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：取走连接后若监听端点已无待处理连接，必须清除客户端上的 `INCOMING`，
    ///   否则客户端会在空队列上反复被唤醒；
    /// - **契约 (What)**：无连接时返回 `EAGAIN`；`want_addr` 为真时返回对端地址；
    ///   新连接被包装进一个全新的桥接，构造屏障与普通创建相同；
    /// - **风险 (Trade-offs)**：清除信号在 `incoming` 锁内复核端点就绪状态，与 read loop 的置位互斥。
    pub async fn accept(
        &self,
        want_addr: bool,
    ) -> Result<(Option<SocketAddr>, StreamSocket), SocketError> {
        let bridge = &self.bridge;
        let mut peer_addr = FullAddress::default();
        let (endpoint, queue) = bridge
            .base
            .endpoint()
            .accept(want_addr.then_some(&mut peer_addr))?;

        {
            let mut incoming = bridge.incoming.lock();
            if *incoming && bridge.base.endpoint().readiness(EventMask::IN).is_empty() {
                if let Err(err) = bridge.local.signal_peer(Signals::INCOMING, Signals::empty()) {
                    drop(incoming);
                    endpoint.close();
                    return Err(err.into());
                }
                *incoming = false;
            }
        }

        log_accepted(bridge, endpoint.as_ref());

        let base = BaseSocket::new(
            endpoint,
            queue,
            bridge.base.transport(),
            bridge.base.network(),
        );
        let accepted =
            StreamBridge::start(base, Arc::clone(&bridge.registry), Arc::clone(&bridge.config))
                .await;
        let addr = want_addr.then(|| peer_addr.to_socket_addr(bridge.base.network()));
        Ok((addr, StreamSocket::attach(accepted)))
    }

    /// 半关闭客户端一侧的句柄。
    pub fn shutdown(&self, mode: ShutdownMode) -> Result<(), SocketError> {
        if mode.is_empty() {
            return Err(Errno::Einval.into());
        }
        self.bridge.peer.shutdown(mode)?;
        debug!(koid = self.bridge.koid, ?mode, "shutdown");
        Ok(())
    }

    /// 返回客户端句柄的一个副本。
    pub fn describe(&self) -> Result<Handle, SocketError> {
        let handle = self.bridge.peer.duplicate()?;
        debug!(koid = self.bridge.koid, "describe");
        Ok(handle)
    }

    /// 为同一桥接建立新的客户端连接。
    pub fn clone_socket(&self) -> StreamSocket {
        debug!(koid = self.bridge.koid, "clone");
        StreamSocket::attach(Arc::clone(&self.bridge))
    }

    /// 关闭本连接。
    ///
    /// 最后一个连接关闭时：启用 `SO_LINGER` 则在本调用内等待拆除完成（写循环最多排空 linger 时长）；
    /// 否则拆除在后台进行，本调用立即返回。
    pub async fn close(mut self) {
        self.closed = true;
        debug!(koid = self.bridge.koid, "close");
        release(Arc::clone(&self.bridge)).await;
    }
}

impl Drop for StreamSocket {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            let bridge = Arc::clone(&self.bridge);
            self.bridge.runtime.spawn(release(bridge));
        }
    }
}

impl fmt::Debug for StreamSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSocket")
            .field("bridge", &self.bridge)
            .finish()
    }
}

async fn release(bridge: Arc<StreamBridge>) {
    if !bridge.base.dec_ref() {
        return;
    }

    let linger = match bridge.base.endpoint().get_sock_opt(SocketOptionName::Linger) {
        Ok(SocketOption::Linger(linger)) => linger,
        Ok(other) => bridge.fatal(format_args!("endpoint answered Linger with {other:?}")),
        Err(err) => {
            warn!(koid = bridge.koid, error = %err, "SO_LINGER unavailable, closing in background");
            LingerOption::default()
        }
    };

    if linger.enabled {
        // 启用 linger 时 close 须等待排队数据发送完毕或 linger 超时。
        bridge.arm_linger(linger.timeout);
        bridge.teardown_and_release_peer().await;
    } else {
        // 句柄中可能仍有未搬运到端点的数据，不能立即关闭端点；以 TCP_LINGER2 作为排空截止时间。
        let linger2 = match bridge.base.endpoint().get_sock_opt(SocketOptionName::TcpLinger2) {
            Ok(SocketOption::TcpLinger2(timeout)) => timeout,
            _ => bridge.config.default_linger2(),
        };
        bridge.arm_linger(linger2);
        let runtime = bridge.runtime.clone();
        runtime.spawn(async move { bridge.teardown_and_release_peer().await });
    }
}

fn log_accepted(bridge: &StreamBridge, accepted: &dyn StackEndpoint) {
    // 连接可能在 accept 返回后、此处之前被 RST，此时地址查询返回 NotConnected。
    match accepted.local_address() {
        Err(TransportError::NotConnected) => {
            debug!(koid = bridge.koid, "accepted endpoint already disconnected");
        }
        Err(err) => bridge.fatal(format_args!("accepted endpoint local address: {err}")),
        Ok(local) => match accepted.remote_address() {
            Err(TransportError::NotConnected) => {
                debug!(koid = bridge.koid, %local, "accepted endpoint already disconnected");
            }
            Err(err) => bridge.fatal(format_args!("accepted endpoint remote address: {err}")),
            Ok(remote) => debug!(koid = bridge.koid, %local, %remote, "accept"),
        },
    }
}
