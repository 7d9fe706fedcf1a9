//! 配置管理模块

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::probe::ServerVersion;
use crate::recovery::RecoveryPolicy;
use crate::{Result, TopologyError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub interaction: InteractionConfig,
    #[serde(default)]
    pub routers: RouterPolicyConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            metadata: MetadataConfig::default(),
            timeouts: TimeoutConfig::default(),
            interaction: InteractionConfig::default(),
            routers: RouterPolicyConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl TopologyConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            TopologyError::ConfigError(format!("Failed to read config file: {}", e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TopologyConfig = toml::from_str(content).map_err(|e| {
            TopologyError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// 加载默认配置文件
    pub fn load_default() -> Result<Self> {
        Self::load_from_file("config/topology.toml")
    }

    fn validate(&self) -> Result<()> {
        self.routers.minimum_version()?;
        self.recovery.clone_minimum_version()?;
        if self.metadata.max_commit_retries == 0 {
            return Err(TopologyError::ConfigError(
                "metadata.max_commit_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// 写入视图变更记录的操作者名称
    #[serde(default = "default_actor")]
    pub actor: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            actor: default_actor(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// 元数据持久化文件路径（为空时仅保存在内存中）
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_backup_suffix")]
    pub backup_suffix: String,
    /// 乐观事务冲突时的最大重试次数
    #[serde(default = "default_commit_retries")]
    pub max_commit_retries: usize,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            path: None,
            backup_suffix: default_backup_suffix(),
            max_commit_retries: default_commit_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// 等待同步超时，0 表示不限
    #[serde(default)]
    pub sync_timeout_ms: u64,
    /// 组复制故障检测窗口（超过后不可达成员视为 MISSING）
    #[serde(default = "default_failure_window")]
    pub failure_detection_window_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            sync_timeout_ms: 0,
            failure_detection_window_ms: default_failure_window(),
        }
    }
}

impl TimeoutConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Option<Duration> {
        match self.sync_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn failure_detection_window(&self) -> Duration {
        Duration::from_millis(self.failure_detection_window_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionConfig {
    #[serde(default = "default_false")]
    pub interactive: bool,
}

impl Default for InteractionConfig {
    fn default() -> Self {
        Self { interactive: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterPolicyConfig {
    /// 元数据升级前要求的最低 Router 版本
    #[serde(default = "default_router_floor")]
    pub minimum_version: String,
}

impl Default for RouterPolicyConfig {
    fn default() -> Self {
        Self {
            minimum_version: default_router_floor(),
        }
    }
}

impl RouterPolicyConfig {
    pub fn minimum_version(&self) -> Result<ServerVersion> {
        self.minimum_version.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default)]
    pub default_policy: RecoveryPolicy,
    /// 支持 clone 的最低服务器版本
    #[serde(default = "default_clone_floor")]
    pub clone_minimum_version: String,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            default_policy: RecoveryPolicy::Auto,
            clone_minimum_version: default_clone_floor(),
        }
    }
}

impl RecoveryConfig {
    pub fn clone_minimum_version(&self) -> Result<ServerVersion> {
        self.clone_minimum_version.parse()
    }
}

// 默认值函数
fn default_name() -> String {
    "qatopology".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_actor() -> String {
    "qatopology-admin".to_string()
}
fn default_backup_suffix() -> String {
    "backup".to_string()
}
fn default_commit_retries() -> usize {
    3
}
fn default_connect_timeout() -> u64 {
    10_000
}
fn default_failure_window() -> u64 {
    5_000
}
fn default_false() -> bool {
    false
}
fn default_router_floor() -> String {
    "8.0.19".to_string()
}
fn default_clone_floor() -> String {
    "8.0.17".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = TopologyConfig::from_toml_str("").unwrap();
        assert_eq!(config.metadata.max_commit_retries, 3);
        assert!(config.timeouts.sync_timeout().is_none());
        assert_eq!(config.routers.minimum_version().unwrap().to_string(), "8.0.19");
        assert_eq!(config.recovery.default_policy, RecoveryPolicy::Auto);
    }

    #[test]
    fn test_partial_sections() {
        let config = TopologyConfig::from_toml_str(
            r#"
            [timeouts]
            sync_timeout_ms = 2500

            [interaction]
            interactive = true

            [recovery]
            default_policy = "clone"
            "#,
        )
        .unwrap();
        assert_eq!(config.timeouts.sync_timeout(), Some(Duration::from_millis(2500)));
        assert!(config.interaction.interactive);
        assert_eq!(config.recovery.default_policy, RecoveryPolicy::Clone);
        assert_eq!(config.timeouts.connect_timeout_ms, 10_000);
    }

    #[test]
    fn test_invalid_router_floor_rejected() {
        let err = TopologyConfig::from_toml_str("[routers]\nminimum_version = \"eight\"\n");
        assert!(err.is_err());
    }
}
