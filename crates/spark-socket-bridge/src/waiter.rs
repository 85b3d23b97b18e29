//! 协议栈端点的事件通知队列。
//!
//! 端点在状态变化时调用 [`WaitQueue::notify`]，已注册的条目若关心其中任一事件即被触发。
//! 条目有两种形态：同步回调，以及容量为 1 的通道（多次通知合并为一次唤醒）。

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use parking_lot::Mutex;
use tokio::sync::mpsc;

bitflags! {
    /// 端点事件集合。
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct EventMask: u32 {
        /// 可读，或监听端点上有待接受的连接。
        const IN = 1 << 0;
        /// 可写，或连接状态已确定。
        const OUT = 1 << 2;
        const ERR = 1 << 3;
        /// 挂断：端点已不可用。
        const HUP = 1 << 4;
    }
}

/// 注册条目的标识，用于 [`WaitQueue::unregister`]。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct EntryId(u64);

type Callback = Box<dyn Fn(EventMask) + Send + Sync>;

enum Notifier {
    Callback(Callback),
    Channel(mpsc::Sender<()>),
}

struct Entry {
    mask: EventMask,
    notifier: Notifier,
}

/// 端点事件队列。
///
/// # 教案式说明
/// - **意图 (Why)**：桥接循环需要在“端点可读/可写/挂断”时被唤醒，而端点实现不应知道唤醒的是谁；
/// - **契约 (What)**：
///   - 回调在队列锁内同步执行，只允许做不阻塞、不重入队列的工作（例如 `spawn` 一个任务）；
///   - 通道条目使用 `try_send`，通道已满时丢弃本次通知，接收方醒来后会重新检查端点状态；
///   - 注销不存在的条目视为逻辑错误，直接 panic；
/// - **风险 (Trade-offs)**：回调持锁执行避免了注销与触发之间的竞态，代价是回调内不能再访问本队列。
#[derive(Default)]
pub struct WaitQueue {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Entry>>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, mask: EventMask, notifier: Notifier) -> EntryId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(id, Entry { mask, notifier });
        EntryId(id)
    }

    /// 注册同步回调。
    pub fn register<F>(&self, mask: EventMask, callback: F) -> EntryId
    where
        F: Fn(EventMask) + Send + Sync + 'static,
    {
        self.insert(mask, Notifier::Callback(Box::new(callback)))
    }

    /// 注册通道条目，返回的接收端在事件发生时收到一个 `()`。
    pub fn register_channel(&self, mask: EventMask) -> (EntryId, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (self.insert(mask, Notifier::Channel(tx)), rx)
    }

    /// 注销条目。
    ///
    /// # Panics
    /// 条目不存在（重复注销）时 panic。
    pub fn unregister(&self, entry: EntryId) {
        if self.entries.lock().remove(&entry.0).is_none() {
            panic!("wait queue entry {entry:?} unregistered twice");
        }
    }

    /// 通知所有关心 `events` 的条目。
    pub fn notify(&self, events: EventMask) {
        let entries = self.entries.lock();
        for entry in entries.values() {
            let hit = entry.mask & events;
            if hit.is_empty() {
                continue;
            }
            match &entry.notifier {
                Notifier::Callback(callback) => callback(hit),
                Notifier::Channel(tx) => {
                    let _ = tx.try_send(());
                }
            }
        }
    }

    /// 当前注册的条目数。
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitQueue")
            .field("entries", &self.len())
            .finish()
    }
}
