#![deny(unsafe_code)]
#![doc = r#"
# spark-socket-bridge

## 模块使命（Why）
- **句柄与协议栈之间的桥**：客户端进程只持有内核句柄（字节流 socket 或事件对），真正的 TCP/UDP/ICMP
  状态机运行在用户态协议栈中；本 crate 负责在两者之间搬运数据、传播半关闭/全关闭与错误。
- **POSIX 语义落地**：bind/connect/listen/accept/shutdown/getsockopt 等操作在此映射为协议栈端点调用，
  协议栈错误统一转换为 POSIX 错误码。

## 核心契约（What）
- [`SocketProvider`] 是唯一的创建入口：校验地址族与协议后返回 [`StreamSocket`] 或 [`DatagramSocket`]。
- 字节流套接字由 [`StreamBridge`] 驱动：每个桥接运行 poller、read loop、write loop 三个任务，
  客户端在句柄上观察 `INCOMING` / `OUTGOING` / `CONNECTED` 用户信号。
- 数据报套接字由 [`DatagramBridge`] 驱动：报文通过 `recv_msg` / `send_msg` 同步收发，事件对只承载信号。
- 协议栈通过 [`StackEndpoint`] / [`NetworkStack`] 两个 trait 接入，事件通知经由 [`WaitQueue`] 回传。
- 约束：调用方必须运行在 Tokio 多线程运行时内。

## 实现策略（How）
- 句柄（[`handle`]）以 `parking_lot` 互斥量保护缓冲，以 `tokio::sync::watch` 广播信号位；
- 拆除顺序由一次性闩锁（[`latch`]）编排，保证任意多个并发关闭方只触发一次副作用；
- 活跃端点登记在基于 `DashMap` 的 [`SocketRegistry`] 中，供诊断与统计使用。

## 功能开关：`test-util`
- 打开后导出 [`test_stubs`]：脚本化的内存协议栈，供集成测试与下游契约测试使用。
"#]

pub mod address;
pub mod base;
pub mod config;
pub mod datagram;
pub mod endpoint;
pub mod error;
pub mod handle;
pub mod latch;
pub mod provider;
pub mod registry;
pub mod stream;
pub mod waiter;

#[cfg(any(test, feature = "test-util"))]
pub mod test_stubs;

pub use address::FullAddress;
pub use base::BaseSocket;
pub use config::BridgeConfig;
pub use datagram::{DatagramBridge, DatagramSocket, RecvMsgResponse};
pub use endpoint::{
    LingerOption, NetworkProtocol, NetworkStack, Resolution, SocketOption, SocketOptionName,
    StackEndpoint, TransportProtocol, WriteError, WriteOptions,
};
pub use error::{ConfigError, Errno, HandleError, SocketError, TransportError};
pub use handle::{Handle, HandleKind, Koid, ShutdownMode, Signals, SocketMode};
pub use provider::{DatagramSocketProtocol, Domain, SocketProvider, StreamSocketProtocol};
pub use registry::{RegistryStats, SocketRegistry};
pub use stream::{StreamBridge, StreamSocket};
pub use waiter::{EntryId, EventMask, WaitQueue};
