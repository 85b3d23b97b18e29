//! # config 模块说明
//!
//! ## 角色定位（Why）
//! - 集中桥接层的可调参数：循环单次搬运的块大小、句柄容量，以及端点无法报告
//!   `TcpLinger2` 时使用的兜底值；
//! - 以 TOML 片段形式由宿主进程注入，缺省字段回落到内置默认值。
//!
//! ## 契约（What）
//! - 所有尺寸字段必须大于零，[`BridgeConfig::from_toml_str`] 在解析后立即校验；
//! - 直接构造的 `BridgeConfig` 不经校验，调用方自行保证取值合法。

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// 字节流写循环单次从句柄读取的最大字节数。
pub const DEFAULT_STREAM_WRITE_CHUNK: usize = 2048;
/// 数据报写循环单次读取的最大字节数，覆盖最大 UDP 负载。
pub const DEFAULT_DATAGRAM_WRITE_CHUNK: usize = 64 * 1024;
/// 句柄每个方向可排队的最大字节数。
pub const DEFAULT_HANDLE_CAPACITY: usize = 256 * 1024;
/// 与 Linux `tcp_fin_timeout` 默认值一致。
pub const DEFAULT_LINGER2_MS: u64 = 60_000;

/// 桥接配置。
///
/// # 教案式说明
/// - **意图 (Why)**：块大小决定单次系统调用的搬运量，容量决定客户端可以领先协议栈多少字节；
///   两者都需要按部署环境调节，因此不写死在循环里；
/// - **契约 (What)**：`#[serde(default)]` 使任意子集的字段都可省略；
/// - **风险 (Trade-offs)**：数据报块大小小于实际报文时，报文会在写循环被截断。
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    pub stream_write_chunk: usize,
    pub datagram_write_chunk: usize,
    pub handle_capacity: usize,
    pub default_linger2_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            stream_write_chunk: DEFAULT_STREAM_WRITE_CHUNK,
            datagram_write_chunk: DEFAULT_DATAGRAM_WRITE_CHUNK,
            handle_capacity: DEFAULT_HANDLE_CAPACITY,
            default_linger2_ms: DEFAULT_LINGER2_MS,
        }
    }
}

impl BridgeConfig {
    /// 解析并校验 TOML 配置。
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// 校验尺寸字段均大于零。
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("stream_write_chunk", self.stream_write_chunk),
            ("datagram_write_chunk", self.datagram_write_chunk),
            ("handle_capacity", self.handle_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroSize { field });
            }
        }
        Ok(())
    }

    pub fn default_linger2(&self) -> Duration {
        Duration::from_millis(self.default_linger2_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = BridgeConfig::from_toml_str("").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.default_linger2(), Duration::from_secs(60));
    }

    #[test]
    fn partial_document_overrides_named_fields() {
        let config = BridgeConfig::from_toml_str(
            "stream_write_chunk = 512\nhandle_capacity = 4096\n",
        )
        .unwrap();
        assert_eq!(config.stream_write_chunk, 512);
        assert_eq!(config.handle_capacity, 4096);
        assert_eq!(config.datagram_write_chunk, DEFAULT_DATAGRAM_WRITE_CHUNK);
    }

    #[test]
    fn zero_sizes_and_unknown_fields_are_rejected() {
        let err = BridgeConfig::from_toml_str("handle_capacity = 0").unwrap_err();
        assert!(
            matches!(err, ConfigError::ZeroSize { field: "handle_capacity" }),
            "零容量必须被拒绝: {err}"
        );
        assert!(matches!(
            BridgeConfig::from_toml_str("chunk = 1"),
            Err(ConfigError::Parse(_))
        ));
    }
}
