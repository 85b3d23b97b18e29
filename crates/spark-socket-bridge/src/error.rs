//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义桥接层涉及的三类错误域：协议栈端点返回的 [`TransportError`]、内核句柄返回的
//!   [`HandleError`]，以及面向上层 RPC 的 [`SocketError`]；
//! - 将“协议栈错误 → POSIX 错误码”的映射收敛为一个纯函数，保证同一错误在任何调用路径上
//!   都得到同一个错误码。
//!
//! ## 设计要求（What）
//! - 所有错误类型实现 `thiserror::Error`，可直接用 `?` 在错误域之间转换；
//! - [`TransportError::to_errno`] 为穷举 `match`：新增错误种类时若遗漏映射将直接编译失败，
//!   不存在“未知错误被静默吞掉”的路径；
//! - [`TransportError::is_hard`] 固定硬错误分类，供 [`BaseSocket`](crate::base::BaseSocket) 的硬错误缓存使用。
//!
//! ## 风险提示（Trade-offs）
//! - `Errno` 采用 Linux 数值；若宿主平台编号不同，应在 RPC 编码层做二次转换。

use std::fmt;

use thiserror::Error;

/// 协议栈端点在非阻塞调用中可能返回的全部结果种类。
///
/// # 教案式说明
/// - **意图 (Why)**：桥接循环需要针对每种结果选择“重试 / 半关闭 / 终止 / 仅记录”中的一种动作，
///   因此错误必须是可穷举匹配的封闭集合，而不是字符串；
/// - **契约 (What)**：类型为 `Copy`，可在锁内比较、缓存；`Display` 文案稳定，仅用于日志；
/// - **风险 (Trade-offs)**：变体集合与协议栈实现绑定，新增变体时需同步更新 [`to_errno`](Self::to_errno)。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Error)]
pub enum TransportError {
    #[error("unknown protocol")]
    UnknownProtocol,
    #[error("unknown nic")]
    UnknownNicId,
    #[error("unknown device")]
    UnknownDevice,
    #[error("unknown option")]
    UnknownProtocolOption,
    #[error("duplicate nic id")]
    DuplicateNicId,
    #[error("duplicate address")]
    DuplicateAddress,
    #[error("no route")]
    NoRoute,
    #[error("bad link layer endpoint")]
    BadLinkEndpoint,
    #[error("endpoint already bound")]
    AlreadyBound,
    #[error("endpoint is in invalid state")]
    InvalidEndpointState,
    #[error("endpoint is already connecting")]
    AlreadyConnecting,
    #[error("endpoint is already connected")]
    AlreadyConnected,
    #[error("no ports are available")]
    NoPortAvailable,
    #[error("port is in use")]
    PortInUse,
    #[error("bad local address")]
    BadLocalAddress,
    #[error("endpoint is closed for send")]
    ClosedForSend,
    #[error("endpoint is closed for receive")]
    ClosedForReceive,
    #[error("operation would block")]
    WouldBlock,
    #[error("connection was refused")]
    ConnectionRefused,
    #[error("operation timed out")]
    Timeout,
    #[error("operation aborted")]
    Aborted,
    #[error("connection attempt started")]
    ConnectStarted,
    #[error("destination address is required")]
    DestinationRequired,
    #[error("operation not supported")]
    NotSupported,
    #[error("queue size querying not supported")]
    QueueSizeNotSupported,
    #[error("endpoint not connected")]
    NotConnected,
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("connection aborted")]
    ConnectionAborted,
    #[error("no such file")]
    NoSuchFile,
    #[error("invalid option value specified")]
    InvalidOptionValue,
    #[error("no remote link address")]
    NoLinkAddress,
    #[error("bad address")]
    BadAddress,
    #[error("network is unreachable")]
    NetworkUnreachable,
    #[error("message too long")]
    MessageTooLong,
    #[error("no buffer space available")]
    NoBufferSpace,
    #[error("broadcast socket option disabled")]
    BroadcastDisabled,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("address family not supported by protocol")]
    AddressFamilyNotSupported,
}

impl TransportError {
    /// 判断错误是否意味着端点已进入不可恢复的终态。
    ///
    /// - **契约 (What)**：仅 `ConnectionAborted`、`ConnectionReset`、`NetworkUnreachable`、
    ///   `NoRoute`、`Timeout`、`ConnectionRefused` 返回 `true`；其余均视为瞬时错误，永不缓存。
    pub fn is_hard(self) -> bool {
        matches!(
            self,
            TransportError::ConnectionAborted
                | TransportError::ConnectionReset
                | TransportError::NetworkUnreachable
                | TransportError::NoRoute
                | TransportError::Timeout
                | TransportError::ConnectionRefused
        )
    }

    /// 将协议栈错误映射为 POSIX 错误码。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：RPC 层只认识错误码；映射必须是纯函数且对每个种类恰有一条规则；
    /// - **执行 (How)**：穷举匹配，不设通配分支，遗漏映射在编译期即被发现；
    /// - **注意 (Gotchas)**：`ClosedForReceive` 映射为 `EAGAIN`，`Aborted` 映射为 `EPIPE`，
    ///   两者均与直觉不同，但与 Linux 用户态可观察行为一致。
    pub fn to_errno(self) -> Errno {
        match self {
            TransportError::UnknownProtocol => Errno::Einval,
            TransportError::UnknownNicId => Errno::Einval,
            TransportError::UnknownDevice => Errno::Enodev,
            TransportError::UnknownProtocolOption => Errno::Enoprotoopt,
            TransportError::DuplicateNicId => Errno::Eexist,
            TransportError::DuplicateAddress => Errno::Eexist,
            TransportError::NoRoute => Errno::Ehostunreach,
            TransportError::BadLinkEndpoint => Errno::Einval,
            TransportError::AlreadyBound => Errno::Einval,
            TransportError::InvalidEndpointState => Errno::Einval,
            TransportError::AlreadyConnecting => Errno::Ealready,
            TransportError::AlreadyConnected => Errno::Eisconn,
            TransportError::NoPortAvailable => Errno::Eagain,
            TransportError::PortInUse => Errno::Eaddrinuse,
            TransportError::BadLocalAddress => Errno::Eaddrnotavail,
            TransportError::ClosedForSend => Errno::Epipe,
            TransportError::ClosedForReceive => Errno::Eagain,
            TransportError::WouldBlock => Errno::EWOULDBLOCK,
            TransportError::ConnectionRefused => Errno::Econnrefused,
            TransportError::Timeout => Errno::Etimedout,
            TransportError::Aborted => Errno::Epipe,
            TransportError::ConnectStarted => Errno::Einprogress,
            TransportError::DestinationRequired => Errno::Edestaddrreq,
            TransportError::NotSupported => Errno::Eopnotsupp,
            TransportError::QueueSizeNotSupported => Errno::Enotty,
            TransportError::NotConnected => Errno::Enotconn,
            TransportError::ConnectionReset => Errno::Econnreset,
            TransportError::ConnectionAborted => Errno::Econnaborted,
            TransportError::NoSuchFile => Errno::Enoent,
            TransportError::InvalidOptionValue => Errno::Einval,
            TransportError::NoLinkAddress => Errno::Ehostdown,
            TransportError::BadAddress => Errno::Efault,
            TransportError::NetworkUnreachable => Errno::Enetunreach,
            TransportError::MessageTooLong => Errno::Emsgsize,
            TransportError::NoBufferSpace => Errno::Enobufs,
            TransportError::BroadcastDisabled | TransportError::NotPermitted => Errno::Eacces,
            TransportError::AddressFamilyNotSupported => Errno::Eafnosupport,
        }
    }
}

/// POSIX 错误码（Linux 编号）。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(i32)]
pub enum Errno {
    Enoent = 2,
    Eagain = 11,
    Eacces = 13,
    Efault = 14,
    Eexist = 17,
    Enodev = 19,
    Einval = 22,
    Enotty = 25,
    Epipe = 32,
    Edestaddrreq = 89,
    Emsgsize = 90,
    Enoprotoopt = 92,
    Eprotonosupport = 93,
    Eopnotsupp = 95,
    Epfnosupport = 96,
    Eafnosupport = 97,
    Eaddrinuse = 98,
    Eaddrnotavail = 99,
    Enetunreach = 101,
    Econnaborted = 103,
    Econnreset = 104,
    Enobufs = 105,
    Eisconn = 106,
    Enotconn = 107,
    Etimedout = 110,
    Econnrefused = 111,
    Ehostdown = 112,
    Ehostunreach = 113,
    Ealready = 114,
    Einprogress = 115,
}

impl Errno {
    /// Linux 上 `EWOULDBLOCK` 与 `EAGAIN` 数值相同。
    pub const EWOULDBLOCK: Errno = Errno::Eagain;

    /// 返回错误码的数值表示。
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// 内核句柄（就绪原语）操作返回的状态。
///
/// - **契约 (What)**：`ShouldWait` 与 `BadState`/`PeerClosed` 必须可区分，桥接循环据此决定
///   “等待信号”还是“传播半关闭”。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum HandleError {
    /// 非阻塞操作暂时无法完成，需等待对应信号。
    #[error("operation should wait")]
    ShouldWait,
    /// 该方向已被关闭（shutdown）。
    #[error("handle is in a bad state for this operation")]
    BadState,
    /// 对端对象已被关闭。
    #[error("peer handle closed")]
    PeerClosed,
    /// 句柄已释放。
    #[error("bad handle")]
    BadHandle,
    /// 对象类型不支持该操作（例如在事件对上读写数据）。
    #[error("operation not supported by this handle kind")]
    NotSupported,
    /// 数据报超过句柄容量。
    #[error("message exceeds handle capacity")]
    OutOfRange,
    /// 参数非法，例如试图通过 `signal` 修改非用户信号位。
    #[error("invalid arguments")]
    InvalidArgs,
    /// 等待超时。
    #[error("wait timed out")]
    TimedOut,
}

/// 面向上层 RPC 的套接字操作错误。
///
/// # 教案式说明
/// - **意图 (Why)**：对应“成功负载或 POSIX 错误码”的返回约定；句柄层失败单独成类，
///   由 RPC 层决定是否断开连接；
/// - **契约 (What)**：`From<TransportError>` 经由 [`TransportError::to_errno`] 转换，
///   调用方可直接使用 `?` 传播协议栈错误。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum SocketError {
    #[error("socket operation failed with {0}")]
    Errno(Errno),
    #[error(transparent)]
    Handle(#[from] HandleError),
}

impl SocketError {
    /// 若错误属于 POSIX 错误码，则返回之。
    pub fn errno(&self) -> Option<Errno> {
        match self {
            SocketError::Errno(errno) => Some(*errno),
            SocketError::Handle(_) => None,
        }
    }
}

impl From<TransportError> for SocketError {
    fn from(value: TransportError) -> Self {
        SocketError::Errno(value.to_errno())
    }
}

impl From<Errno> for SocketError {
    fn from(value: Errno) -> Self {
        SocketError::Errno(value)
    }
}

/// 配置加载失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse bridge configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid bridge configuration: `{field}` must be greater than zero")]
    ZeroSize { field: &'static str },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_error_taxonomy_is_fixed() {
        let hard = [
            TransportError::ConnectionAborted,
            TransportError::ConnectionReset,
            TransportError::NetworkUnreachable,
            TransportError::NoRoute,
            TransportError::Timeout,
            TransportError::ConnectionRefused,
        ];
        for err in hard {
            assert!(err.is_hard(), "{err} 应被视为硬错误");
        }
        for err in [
            TransportError::WouldBlock,
            TransportError::ClosedForReceive,
            TransportError::ClosedForSend,
            TransportError::Aborted,
            TransportError::NotConnected,
            TransportError::NoLinkAddress,
        ] {
            assert!(!err.is_hard(), "{err} 属于瞬时错误，不得缓存");
        }
    }

    #[test]
    fn errno_mapping_matches_posix_expectations() {
        assert_eq!(TransportError::WouldBlock.to_errno(), Errno::Eagain);
        assert_eq!(TransportError::ClosedForReceive.to_errno(), Errno::Eagain);
        assert_eq!(TransportError::ConnectionReset.to_errno(), Errno::Econnreset);
        assert_eq!(TransportError::Aborted.to_errno(), Errno::Epipe);
        assert_eq!(TransportError::NoLinkAddress.to_errno(), Errno::Ehostdown);
        assert_eq!(TransportError::NotPermitted.to_errno(), Errno::Eacces);
        assert_eq!(TransportError::ConnectStarted.to_errno().code(), 115);
        assert_eq!(Errno::EWOULDBLOCK.code(), 11);
    }

    #[test]
    fn errno_values_follow_linux_numbering() {
        assert_eq!(TransportError::UnknownDevice.to_errno().code(), 19);
        assert_eq!(TransportError::DuplicateAddress.to_errno().code(), 17);
        assert_eq!(TransportError::BadAddress.to_errno().code(), 14);
        assert_eq!(TransportError::NoSuchFile.to_errno().code(), 2);
    }

    #[test]
    fn socket_error_converts_from_transport_error() {
        let err: SocketError = TransportError::PortInUse.into();
        assert_eq!(err.errno(), Some(Errno::Eaddrinuse));
        let err: SocketError = HandleError::PeerClosed.into();
        assert_eq!(err.errno(), None);
    }
}
