//! 桥接测试使用的脚本化协议栈。
//!
//! # 设计定位（Why）
//! - 桥接的全部行为都由协议栈端点的返回值与事件通知驱动；单元测试与集成测试需要精确控制
//!   “何时可读、可写多少、何时出错、何时到来新连接”；
//! - 各测试文件若各自实现 `StackEndpoint`，接口演进时容易漏改，因此集中在此维护。
//!
//! # 使用方式（How）
//! - 通过 `use spark_socket_bridge::test_stubs::{MockEndpoint, MockStack};` 引入；
//! - 以 [`MockStack`] 作为 [`NetworkStack`](crate::endpoint::NetworkStack) 交给
//!   [`SocketProvider`](crate::provider::SocketProvider)，再用 [`MockStack::created`] 取回端点脚本化其行为。
//!
//! # 契约说明（What）
//! - 所有脚本化辅助方法先释放端点内部锁，再向事件队列发出通知，回调可以安全地回查端点状态；
//! - 端点方法本身从不发出通知，与真实协议栈“状态变化后异步通知”的时序一致。
//!
//! # 风险与权衡（Trade-offs）
//! - 只模拟桥接可观测的行为，不实现任何 TCP/UDP 状态机；连接建立、重置等状态迁移都需测试显式驱动。

mod stack;

pub use stack::{MockEndpoint, MockStack};
