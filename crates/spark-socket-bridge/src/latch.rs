//! 一次性闩锁（Latch）。
//!
//! 桥接中的 `closing`、`*_done`、`linger_gate` 等同步点都是“至多触发一次、可被任意多个等待者观测”的信号，
//! 统一用本类型表达。重复触发是无副作用的空操作，取代“重复关闭即崩溃”的检查。

use tokio::sync::watch;

/// 至多触发一次的多读者信号。
///
/// # 教案式说明
/// - **意图 (Why)**：替代“关闭 channel 作为广播”的写法；重复 `fire` 不会 panic；
/// - **逻辑 (How)**：内部为 `watch::Sender<bool>`，`fire` 通过 `send_if_modified` 原子地从
///   `false` 翻转为 `true`，等待者订阅后用 `wait_for` 观测，先检查当前值再挂起，不会丢失触发；
/// - **契约 (What)**：`fire` 仅在首次调用时返回 `true`；`fired().await` 在触发后立即完成。
#[derive(Debug)]
pub struct Latch {
    state: watch::Sender<bool>,
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch {
    pub fn new() -> Self {
        Self {
            state: watch::Sender::new(false),
        }
    }

    /// 触发闩锁，首次调用返回 `true`。
    pub fn fire(&self) -> bool {
        self.state.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    pub fn is_fired(&self) -> bool {
        *self.state.borrow()
    }

    /// 等待闩锁被触发。
    pub async fn fired(&self) {
        let mut rx = self.state.subscribe();
        // 发送端由 `self` 持有，等待期间不会被丢弃。
        let _ = rx.wait_for(|fired| *fired).await;
    }
}
