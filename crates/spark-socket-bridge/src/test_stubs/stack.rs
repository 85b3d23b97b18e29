use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::address::FullAddress;
use crate::endpoint::{
    LingerOption, NetworkProtocol, NetworkStack, Resolution, SocketOption, SocketOptionName,
    StackEndpoint, TransportProtocol, WriteError, WriteOptions,
};
use crate::error::TransportError;
use crate::handle::ShutdownMode;
use crate::waiter::{EventMask, WaitQueue};

#[derive(Default)]
struct EndpointState {
    connected: bool,
    listening: bool,
    backlog: Option<usize>,
    inbound: VecDeque<(Bytes, FullAddress)>,
    read_error: Option<TransportError>,
    write_error: Option<TransportError>,
    connect_error: Option<TransportError>,
    shutdown_error: Option<TransportError>,
    write_credit: Option<usize>,
    written: Vec<u8>,
    sent: Vec<(Bytes, Option<FullAddress>)>,
    resolutions: VecDeque<Resolution>,
    local: FullAddress,
    remote: Option<FullAddress>,
    accepts: VecDeque<(Arc<MockEndpoint>, FullAddress)>,
    shutdowns: Vec<ShutdownMode>,
    disconnects: usize,
    closes: usize,
    moderated: usize,
    options: HashMap<SocketOptionName, SocketOption>,
}

/// 脚本化的协议栈端点。
///
/// - 字节流端点初始未连接，读返回 `NotConnected`，直到 [`establish`](Self::establish)、
///   成功的 `connect` 或作为 [`push_connection`](Self::push_connection) 的产物；
/// - 写入默认无限接受，[`limit_writes`](Self::limit_writes) 之后按额度接受，额度耗尽返回 `WouldBlock`；
/// - 注入的读/写错误是粘滞的：入站队列耗尽后持续返回。
pub struct MockEndpoint {
    transport: TransportProtocol,
    queue: Arc<WaitQueue>,
    state: Mutex<EndpointState>,
}

impl MockEndpoint {
    pub fn new(transport: TransportProtocol, queue: Arc<WaitQueue>) -> Arc<MockEndpoint> {
        Arc::new(MockEndpoint {
            transport,
            queue,
            state: Mutex::new(EndpointState {
                connected: !transport.is_stream(),
                ..EndpointState::default()
            }),
        })
    }

    pub fn transport(&self) -> TransportProtocol {
        self.transport
    }

    pub fn queue(&self) -> &Arc<WaitQueue> {
        &self.queue
    }

    fn update<R>(&self, events: EventMask, change: impl FnOnce(&mut EndpointState) -> R) -> R {
        let result = change(&mut self.state.lock());
        if !events.is_empty() {
            self.queue.notify(events);
        }
        result
    }

    /// 追加一段入站字节流数据。
    pub fn push_inbound(&self, data: &[u8]) {
        self.update(EventMask::IN, |state| {
            state
                .inbound
                .push_back((Bytes::copy_from_slice(data), FullAddress::default()));
        });
    }

    /// 追加一个来自 `from` 的入站报文。
    pub fn push_datagram(&self, data: &[u8], from: FullAddress) {
        self.update(EventMask::IN, |state| {
            state.inbound.push_back((Bytes::copy_from_slice(data), from));
        });
    }

    /// 在监听端点上排入一个已完成握手的连接，返回该连接的端点。
    pub fn push_connection(&self, remote: FullAddress) -> Arc<MockEndpoint> {
        let accepted = MockEndpoint::new(self.transport, Arc::new(WaitQueue::new()));
        {
            let local = self.state.lock().local;
            let mut state = accepted.state.lock();
            state.connected = true;
            state.local = local;
            state.remote = Some(remote);
        }
        let returned = Arc::clone(&accepted);
        self.update(EventMask::IN, |state| state.accepts.push_back((accepted, remote)));
        returned
    }

    /// 限制后续写入的总额度，不发出通知。
    pub fn limit_writes(&self, credit: usize) {
        self.update(EventMask::empty(), |state| state.write_credit = Some(credit));
    }

    /// 增加写入额度并通知 `OUT`。
    pub fn grant_credit(&self, credit: usize) {
        self.update(EventMask::OUT, |state| {
            state.write_credit = Some(state.write_credit.unwrap_or(0) + credit);
        });
    }

    /// 取消写入额度限制并通知 `OUT`。
    pub fn unlimit_writes(&self) {
        self.update(EventMask::OUT, |state| state.write_credit = None);
    }

    /// 完成连接建立并通知 `OUT`。
    pub fn establish(&self) {
        self.update(EventMask::OUT, |state| state.connected = true);
    }

    pub fn fail_read(&self, err: TransportError) {
        self.update(EventMask::IN | EventMask::OUT, |state| state.read_error = Some(err));
    }

    pub fn clear_read_error(&self) {
        self.update(EventMask::empty(), |state| state.read_error = None);
    }

    pub fn fail_write(&self, err: TransportError) {
        self.update(EventMask::OUT, |state| state.write_error = Some(err));
    }

    /// 读写两个方向同时进入错误态，并通知所有等待者。
    pub fn reset(&self, err: TransportError) {
        self.update(EventMask::IN | EventMask::OUT | EventMask::ERR, |state| {
            state.read_error = Some(err);
            state.write_error = Some(err);
        });
    }

    /// 通知挂断事件。
    pub fn hang_up(&self) {
        self.queue.notify(EventMask::HUP);
    }

    /// 下一次 `connect` 返回 `err`。
    pub fn fail_connect(&self, err: TransportError) {
        self.update(EventMask::empty(), |state| state.connect_error = Some(err));
    }

    pub fn fail_shutdown(&self, err: TransportError) {
        self.update(EventMask::empty(), |state| state.shutdown_error = Some(err));
    }

    /// 下一次写入返回挂起中的地址解析。
    pub fn queue_resolution(&self, resolution: Resolution) {
        self.update(EventMask::empty(), |state| {
            state.resolutions.push_back(resolution)
        });
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    pub fn sent(&self) -> Vec<(Bytes, Option<FullAddress>)> {
        self.state.lock().sent.clone()
    }

    pub fn shutdowns(&self) -> Vec<ShutdownMode> {
        self.state.lock().shutdowns.clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.state.lock().disconnects
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }

    pub fn backlog(&self) -> Option<usize> {
        self.state.lock().backlog
    }

    pub fn moderated(&self) -> usize {
        self.state.lock().moderated
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}

impl StackEndpoint for MockEndpoint {
    fn read(&self, addr: Option<&mut FullAddress>) -> Result<Bytes, TransportError> {
        let mut state = self.state.lock();
        if let Some((payload, from)) = state.inbound.pop_front() {
            if let Some(addr) = addr {
                *addr = from;
            }
            return Ok(payload);
        }
        if let Some(err) = state.read_error {
            return Err(err);
        }
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        Err(TransportError::WouldBlock)
    }

    fn write(&self, data: &[u8], options: &WriteOptions) -> Result<usize, WriteError> {
        let mut state = self.state.lock();
        if let Some(resolution) = state.resolutions.pop_front() {
            return Err(WriteError::Resolving(resolution));
        }
        if let Some(err) = state.write_error {
            return Err(err.into());
        }

        if self.transport.is_stream() {
            if !state.connected {
                return Err(TransportError::NotConnected.into());
            }
            let accepted = state
                .write_credit
                .map_or(data.len(), |credit| credit.min(data.len()));
            if accepted == 0 && !data.is_empty() {
                return Err(TransportError::WouldBlock.into());
            }
            if let Some(credit) = state.write_credit.as_mut() {
                *credit -= accepted;
            }
            state.written.extend_from_slice(&data[..accepted]);
            Ok(accepted)
        } else {
            if options.to.is_none() && state.remote.is_none() {
                return Err(TransportError::DestinationRequired.into());
            }
            state.sent.push((Bytes::copy_from_slice(data), options.to));
            Ok(data.len())
        }
    }

    fn connect(&self, addr: &FullAddress) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        match state.connect_error.take() {
            Some(TransportError::ConnectStarted) => {
                state.remote = Some(*addr);
                Err(TransportError::ConnectStarted)
            }
            Some(err) => Err(err),
            None => {
                state.remote = Some(*addr);
                state.connected = true;
                Ok(())
            }
        }
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.disconnects += 1;
        state.remote = None;
        Ok(())
    }

    fn bind(&self, addr: &FullAddress) -> Result<(), TransportError> {
        self.state.lock().local = *addr;
        Ok(())
    }

    fn listen(&self, backlog: usize) -> Result<(), TransportError> {
        if !self.transport.is_stream() {
            return Err(TransportError::NotSupported);
        }
        let mut state = self.state.lock();
        state.listening = true;
        state.backlog = Some(backlog);
        Ok(())
    }

    fn accept(
        &self,
        peer_addr: Option<&mut FullAddress>,
    ) -> Result<(Arc<dyn StackEndpoint>, Arc<WaitQueue>), TransportError> {
        let mut state = self.state.lock();
        if !state.listening {
            return Err(TransportError::InvalidEndpointState);
        }
        let (accepted, remote) = state
            .accepts
            .pop_front()
            .ok_or(TransportError::WouldBlock)?;
        if let Some(addr) = peer_addr {
            *addr = remote;
        }
        let queue = Arc::clone(&accepted.queue);
        let accepted: Arc<dyn StackEndpoint> = accepted;
        Ok((accepted, queue))
    }

    fn shutdown(&self, how: ShutdownMode) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.shutdowns.push(how);
        match state.shutdown_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn local_address(&self) -> Result<FullAddress, TransportError> {
        Ok(self.state.lock().local)
    }

    fn remote_address(&self) -> Result<FullAddress, TransportError> {
        self.state
            .lock()
            .remote
            .ok_or(TransportError::NotConnected)
    }

    fn readiness(&self, mask: EventMask) -> EventMask {
        let state = self.state.lock();
        let mut ready = EventMask::empty();
        if !state.inbound.is_empty() || !state.accepts.is_empty() || state.read_error.is_some() {
            ready |= EventMask::IN;
        }
        if state.connected && state.write_credit != Some(0) {
            ready |= EventMask::OUT;
        }
        ready & mask
    }

    fn get_sock_opt(&self, name: SocketOptionName) -> Result<SocketOption, TransportError> {
        let state = self.state.lock();
        match (state.options.get(&name), name) {
            (Some(option), _) => Ok(*option),
            (None, SocketOptionName::Linger) => Ok(SocketOption::Linger(LingerOption::default())),
            (None, SocketOptionName::Error) => Ok(SocketOption::Error(None)),
            (None, _) => Err(TransportError::UnknownProtocolOption),
        }
    }

    fn set_sock_opt(&self, option: SocketOption) -> Result<(), TransportError> {
        self.state.lock().options.insert(option.name(), option);
        Ok(())
    }

    fn moderate_recv_buf(&self, copied: usize) {
        self.state.lock().moderated += copied;
    }

    fn close(&self) {
        self.state.lock().closes += 1;
    }
}

impl fmt::Debug for MockEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockEndpoint")
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

/// 记录所创建端点的协议栈。
#[derive(Debug, Default)]
pub struct MockStack {
    created: Mutex<Vec<Arc<MockEndpoint>>>,
    fail_next: Mutex<Option<TransportError>>,
}

impl MockStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// 下一次创建端点返回 `err`。
    pub fn fail_next(&self, err: TransportError) {
        *self.fail_next.lock() = Some(err);
    }

    /// 按创建顺序返回全部端点。
    pub fn created(&self) -> Vec<Arc<MockEndpoint>> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<MockEndpoint>> {
        self.created.lock().last().cloned()
    }
}

impl NetworkStack for MockStack {
    fn new_endpoint(
        &self,
        transport: TransportProtocol,
        _network: NetworkProtocol,
        queue: Arc<WaitQueue>,
    ) -> Result<Arc<dyn StackEndpoint>, TransportError> {
        if let Some(err) = self.fail_next.lock().take() {
            return Err(err);
        }
        let endpoint = MockEndpoint::new(transport, queue);
        self.created.lock().push(Arc::clone(&endpoint));
        let endpoint: Arc<dyn StackEndpoint> = endpoint;
        Ok(endpoint)
    }
}
