//! 元数据 schema 版本

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Result, TopologyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct MetadataVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

/// 元数据与引擎之间的兼容关系
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    /// 版本一致，可读可写
    Compatible,
    /// 元数据较旧：只允许只读操作，需要 upgradeMetadata
    NeedsUpgrade,
    /// 元数据由更新的引擎写入：只允许只读操作
    NewerThanEngine,
}

impl MetadataVersion {
    /// 本引擎使用的 schema 版本
    pub const ENGINE: MetadataVersion = MetadataVersion::new(2, 2, 0);
    /// 仍可升级的最旧版本
    pub const LEGACY: MetadataVersion = MetadataVersion::new(1, 0, 1);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    pub fn compatibility(&self) -> Compatibility {
        match self.cmp(&Self::ENGINE) {
            std::cmp::Ordering::Equal => Compatibility::Compatible,
            std::cmp::Ordering::Less => Compatibility::NeedsUpgrade,
            std::cmp::Ordering::Greater => Compatibility::NewerThanEngine,
        }
    }
}

impl FromStr for MetadataVersion {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(TopologyError::MetadataVersion(format!(
                "Invalid metadata version '{}'",
                s
            )));
        }
        let num = |p: &str| {
            p.parse::<u32>().map_err(|_| {
                TopologyError::MetadataVersion(format!("Invalid metadata version '{}'", s))
            })
        };
        Ok(Self::new(num(parts[0])?, num(parts[1])?, num(parts[2])?))
    }
}

impl fmt::Display for MetadataVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl From<MetadataVersion> for String {
    fn from(v: MetadataVersion) -> String {
        v.to_string()
    }
}

impl TryFrom<String> for MetadataVersion {
    type Error = TopologyError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}
