//! 实例配置检查
//!
//! 加入任何拓扑前，实例必须满足复制的基本配置要求，且必须是独立实例。

use serde::{Deserialize, Serialize};

use super::node::InstanceStatus;
use crate::{Result, TopologyError};

/// 单个不满足要求的变量
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigIssue {
    pub variable: String,
    pub current: String,
    pub required: String,
    /// 需要修改配置文件并重启才能生效
    pub restart_required: bool,
}

impl ConfigIssue {
    fn new(variable: &str, current: Option<&str>, required: &str, restart_required: bool) -> Self {
        Self {
            variable: variable.to_string(),
            current: current.unwrap_or("<unset>").to_string(),
            required: required.to_string(),
            restart_required,
        }
    }
}

/// 把检查结果格式化为单行描述
pub fn describe_issues(issues: &[ConfigIssue]) -> String {
    issues
        .iter()
        .map(|i| {
            format!(
                "{}={} (required {}, {})",
                i.variable,
                i.current,
                i.required,
                if i.restart_required {
                    "restart required"
                } else {
                    "fixable live"
                }
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// 检查复制相关的服务器变量
pub fn check_configuration(status: &InstanceStatus) -> Vec<ConfigIssue> {
    let mut issues = Vec::new();

    let expect = |issues: &mut Vec<ConfigIssue>, name: &str, required: &str, restart: bool| {
        let current = status.variable(name);
        if !current.map(|v| v.eq_ignore_ascii_case(required)).unwrap_or(false) {
            issues.push(ConfigIssue::new(name, current, required, restart));
        }
    };

    expect(&mut issues, "gtid_mode", "ON", true);
    expect(&mut issues, "enforce_gtid_consistency", "ON", true);
    expect(&mut issues, "log_replica_updates", "ON", true);
    expect(&mut issues, "binlog_format", "ROW", false);

    // server_id 为 0 或默认值 1 时不能参与复制
    if status.server_id <= 1 {
        issues.push(ConfigIssue::new(
            "server_id",
            Some(&status.server_id.to_string()),
            "<unique value other than 0 and 1>",
            true,
        ));
    }

    issues
}

/// 检查失败时返回 [`TopologyError::InstanceCheckFailed`]
pub fn ensure_valid_configuration(status: &InstanceStatus) -> Result<()> {
    let issues = check_configuration(status);
    if issues.is_empty() {
        return Ok(());
    }
    Err(TopologyError::InstanceCheckFailed {
        instance: status.address.to_string(),
        issues,
    })
}

/// 实例必须是独立的：不在任何组内，也没有配置复制通道
pub fn ensure_standalone(status: &InstanceStatus) -> Result<()> {
    if let Some(group) = &status.group {
        return Err(TopologyError::InvalidState(format!(
            "Instance {} is already a member of group {}",
            status.address, group.group_name
        )));
    }
    if let Some(channel) = status.channels.first() {
        return Err(TopologyError::InvalidState(format!(
            "Instance {} already has replication channel '{}' configured (source {})",
            status.address, channel.name, channel.source
        )));
    }
    Ok(())
}

/// server_id / server_uuid 在整个拓扑中必须唯一
pub fn ensure_unique_identity<'a>(
    status: &InstanceStatus,
    existing: impl IntoIterator<Item = (&'a str, u32, &'a str)>,
) -> Result<()> {
    for (address, server_id, server_uuid) in existing {
        if address == status.address.to_string() {
            continue;
        }
        if server_uuid.eq_ignore_ascii_case(&status.server_uuid) {
            return Err(TopologyError::InvalidState(format!(
                "Instance {} has the same server_uuid as {}",
                status.address, address
            )));
        }
        if server_id == status.server_id {
            return Err(TopologyError::InvalidState(format!(
                "Instance {} has the same server_id ({}) as {}",
                status.address, server_id, address
            )));
        }
    }
    Ok(())
}
