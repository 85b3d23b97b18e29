//! # SocketRegistry：活跃端点登记表
//!
//! ## 核心意图（Why）
//! - 以 `local` 句柄的 koid 为键记录每个存活桥接对应的协议栈端点，供诊断与统计查询；
//! - 由构造方显式传入桥接，而非进程级全局变量，测试可以各自持有独立实例。
//!
//! ## 行为契约（What）
//! - `add`：键已存在时记录 `warn!` 并保留原条目，返回 `false`；
//! - `remove`：桥接拆除时恰好调用一次，返回被移除的端点；
//! - `created` / `destroyed` 计数只统计成功的插入与移除。
//!
//! ## 风险提示（Trade-offs）
//! - `DashMap` guard 在持有期间会阻塞同分片的写操作，`get` 只返回克隆的 `Arc`，不暴露 guard。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::warn;

use crate::endpoint::StackEndpoint;
use crate::handle::Koid;

/// 登记表计数快照。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RegistryStats {
    pub created: u64,
    pub destroyed: u64,
}

/// 活跃端点登记表。
#[derive(Default)]
pub struct SocketRegistry {
    endpoints: DashMap<Koid, Arc<dyn StackEndpoint>>,
    created: AtomicU64,
    destroyed: AtomicU64,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记端点。
    ///
    /// # 教案式注释
    /// - **意图 (Why)**：koid 由内核对象分配，理论上不会重复；若重复说明上游存在句柄复用缺陷，
    ///   此时保留旧条目以免丢失仍在运行的桥接；
    /// - **契约 (What)**：成功返回 `true` 并累加 `created`。
    pub fn add(&self, key: Koid, endpoint: Arc<dyn StackEndpoint>) -> bool {
        match self.endpoints.entry(key) {
            Entry::Occupied(_) => {
                warn!(koid = key, "endpoint registry already holds this key, keeping existing entry");
                false
            }
            Entry::Vacant(vacant) => {
                vacant.insert(endpoint);
                self.created.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    /// 移除端点。
    pub fn remove(&self, key: Koid) -> Option<Arc<dyn StackEndpoint>> {
        let removed = self.endpoints.remove(&key).map(|(_, endpoint)| endpoint);
        if removed.is_some() {
            self.destroyed.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn get(&self, key: Koid) -> Option<Arc<dyn StackEndpoint>> {
        self.endpoints.get(&key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, key: Koid) -> bool {
        self.endpoints.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for SocketRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketRegistry")
            .field("live", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}
