//! 节点状态与远端控制协议
//!
//! 编排核心对远端节点只依赖三个调用：读取状态、下发控制命令、等待事务应用，
//! 全部定义在 [`NodeClient`] 中。

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::gtid::GtidSet;
use crate::recovery::RecoveryMethod;
use crate::{Result, TopologyError};

// ═══════════════════════════════════════════════════════════════════
// 地址与版本
// ═══════════════════════════════════════════════════════════════════

/// 实例地址 `host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct InstanceAddress {
    pub host: String,
    pub port: u16,
}

impl InstanceAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for InstanceAddress {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (host, port) = s.rsplit_once(':').ok_or_else(|| {
            TopologyError::ArgumentError(format!("Invalid instance address '{}': expected host:port", s))
        })?;
        if host.is_empty() {
            return Err(TopologyError::ArgumentError(format!(
                "Invalid instance address '{}': empty host",
                s
            )));
        }
        let port: u16 = port.parse().map_err(|_| {
            TopologyError::ArgumentError(format!("Invalid instance address '{}': bad port", s))
        })?;
        if port == 0 {
            return Err(TopologyError::ArgumentError(format!(
                "Invalid instance address '{}': port must be non-zero",
                s
            )));
        }
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for InstanceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<InstanceAddress> for String {
    fn from(addr: InstanceAddress) -> String {
        addr.to_string()
    }
}

impl TryFrom<String> for InstanceAddress {
    type Error = TopologyError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// 服务器 / Router 版本号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ServerVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl FromStr for ServerVersion {
    type Err = TopologyError;

    /// 接受 `8.0.35`、`8.0.35-log`、`8.0` 等写法
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || TopologyError::ArgumentError(format!("Invalid version string '{}'", s));
        let mut parts = s.trim().split('.');
        let mut next = |required: bool| -> Result<u32> {
            match parts.next() {
                Some(p) => {
                    let digits: String = p.chars().take_while(|c| c.is_ascii_digit()).collect();
                    digits.parse().map_err(|_| invalid())
                }
                None if required => Err(invalid()),
                None => Ok(0),
            }
        };
        let major = next(true)?;
        let minor = next(true)?;
        let patch = next(false)?;
        Ok(Self::new(major, minor, patch))
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl From<ServerVersion> for String {
    fn from(v: ServerVersion) -> String {
        v.to_string()
    }
}

impl TryFrom<String> for ServerVersion {
    type Error = TopologyError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

// ═══════════════════════════════════════════════════════════════════
// 组复制视图
// ═══════════════════════════════════════════════════════════════════

/// 组成员状态（节点自报或组视图中看到的）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupMemberState {
    Online,
    Recovering,
    Offline,
    Error,
    Unreachable,
}

impl fmt::Display for GroupMemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GroupMemberState::Online => "ONLINE",
            GroupMemberState::Recovering => "RECOVERING",
            GroupMemberState::Offline => "OFFLINE",
            GroupMemberState::Error => "ERROR",
            GroupMemberState::Unreachable => "UNREACHABLE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberRole {
    Primary,
    Secondary,
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberRole::Primary => f.write_str("PRIMARY"),
            MemberRole::Secondary => f.write_str("SECONDARY"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub address: InstanceAddress,
    pub server_uuid: String,
    pub state: GroupMemberState,
    pub role: MemberRole,
}

/// 某个成员看到的组视图
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupView {
    pub group_name: String,
    /// 视图变更事件使用的 GTID uuid
    pub view_change_uuid: Option<String>,
    pub view_id: String,
    pub single_primary: bool,
    pub members: Vec<GroupMember>,
}

impl GroupView {
    pub fn primary(&self) -> Option<&GroupMember> {
        self.members
            .iter()
            .find(|m| m.role == MemberRole::Primary && m.state == GroupMemberState::Online)
    }

    pub fn member(&self, address: &InstanceAddress) -> Option<&GroupMember> {
        self.members.iter().find(|m| &m.address == address)
    }

    pub fn online_count(&self) -> usize {
        self.members
            .iter()
            .filter(|m| m.state == GroupMemberState::Online)
            .count()
    }

    /// 组自身判断的多数派（视图内 ONLINE 成员严格过半）
    pub fn has_quorum(&self) -> bool {
        self.online_count() * 2 > self.members.len()
    }
}

// ═══════════════════════════════════════════════════════════════════
// 异步复制通道
// ═══════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelState {
    On,
    Off,
    Error,
    Connecting,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::On => "ON",
            ChannelState::Off => "OFF",
            ChannelState::Error => "ERROR",
            ChannelState::Connecting => "CONNECTING",
        };
        f.write_str(s)
    }
}

/// receiver / applier 线程状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreadState {
    On,
    Off,
    Connecting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelError {
    pub code: u32,
    pub message: String,
}

impl ChannelError {
    pub const ACCESS_DENIED: u32 = 1045;
    pub const SOURCE_PURGED: u32 = 13114;

    pub fn is_auth_failure(&self) -> bool {
        self.code == Self::ACCESS_DENIED
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub name: String,
    pub source: InstanceAddress,
    pub state: ChannelState,
    pub receiver: ThreadState,
    pub applier: ThreadState,
    /// 配置的延迟（秒）
    pub delay: u32,
    pub last_error: Option<ChannelError>,
    pub user: String,
    /// 是否随组主节点自动迁移
    pub managed: bool,
    /// 接收线程已写入 relay log 的事务（可能尚未应用）
    #[serde(default)]
    pub received_gtid_set: GtidSet,
}

impl ChannelStatus {
    pub fn is_healthy(&self) -> bool {
        self.state == ChannelState::On && self.last_error.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════
// 实例状态
// ═══════════════════════════════════════════════════════════════════

/// 一次探测得到的实例完整状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub address: InstanceAddress,
    pub server_uuid: String,
    pub server_id: u32,
    pub version: ServerVersion,
    pub gtid_executed: GtidSet,
    pub gtid_purged: GtidSet,
    /// 实例当前所在组的视图（不在组内时为 None）
    pub group: Option<GroupView>,
    /// 实例自报的组成员状态
    pub member_state: GroupMemberState,
    /// 上一次加入过的组
    pub last_group_name: Option<String>,
    pub channels: Vec<ChannelStatus>,
    pub super_read_only: bool,
    pub variables: BTreeMap<String, String>,
}

impl InstanceStatus {
    pub fn channel(&self, name: &str) -> Option<&ChannelStatus> {
        self.channels.iter().find(|c| c.name == name)
    }

    pub fn is_group_member(&self) -> bool {
        self.group.is_some()
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(|v| v.as_str())
    }

    /// 组视图中记录的主节点
    pub fn group_primary(&self) -> Option<&InstanceAddress> {
        self.group.as_ref().and_then(|g| g.primary()).map(|m| &m.address)
    }
}

// ═══════════════════════════════════════════════════════════════════
// 控制命令
// ═══════════════════════════════════════════════════════════════════

/// 复制账号
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationCredentials {
    pub user: String,
    pub password: String,
}

impl ReplicationCredentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    /// 生成随机密码
    pub fn generate(user: impl Into<String>) -> Self {
        let password: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        Self::new(user, password)
    }
}

impl fmt::Debug for ReplicationCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationCredentials")
            .field("user", &self.user)
            .field("password", &"****")
            .finish()
    }
}

/// 下发给单个节点的控制命令
#[derive(Debug, Clone)]
pub enum ControlCommand {
    StartGroupReplication {
        group_name: String,
        view_change_uuid: Option<String>,
        bootstrap: bool,
        single_primary: bool,
        /// 加入时的分布式恢复方式（bootstrap 时忽略）
        recovery: Option<RecoveryMethod>,
    },
    StopGroupReplication,
    SetPrimary {
        server_uuid: String,
    },
    /// 以当前可达分区重新定义组成员
    ForceMembers {
        members: Vec<InstanceAddress>,
    },
    CreateReplicationAccount {
        credentials: ReplicationCredentials,
    },
    SetReplicationPassword {
        credentials: ReplicationCredentials,
    },
    DropReplicationAccount {
        user: String,
    },
    ChangeReplicationSource {
        channel: String,
        source: InstanceAddress,
        credentials: ReplicationCredentials,
        delay: u32,
        managed: bool,
    },
    StartReplica {
        channel: String,
    },
    StopReplica {
        channel: String,
    },
    ResetReplica {
        channel: String,
    },
    /// 从 donor 做全量物理复制
    Clone {
        donor: InstanceAddress,
    },
    SetSuperReadOnly {
        enabled: bool,
    },
    AcquireLock {
        owner: String,
    },
    ReleaseLock {
        owner: String,
    },
    SetVariable {
        name: String,
        value: String,
    },
}

impl ControlCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::StartGroupReplication { .. } => "START GROUP_REPLICATION",
            ControlCommand::StopGroupReplication => "STOP GROUP_REPLICATION",
            ControlCommand::SetPrimary { .. } => "SET PRIMARY",
            ControlCommand::ForceMembers { .. } => "FORCE MEMBERS",
            ControlCommand::CreateReplicationAccount { .. } => "CREATE REPLICATION ACCOUNT",
            ControlCommand::SetReplicationPassword { .. } => "SET REPLICATION PASSWORD",
            ControlCommand::DropReplicationAccount { .. } => "DROP REPLICATION ACCOUNT",
            ControlCommand::ChangeReplicationSource { .. } => "CHANGE REPLICATION SOURCE",
            ControlCommand::StartReplica { .. } => "START REPLICA",
            ControlCommand::StopReplica { .. } => "STOP REPLICA",
            ControlCommand::ResetReplica { .. } => "RESET REPLICA",
            ControlCommand::Clone { .. } => "CLONE",
            ControlCommand::SetSuperReadOnly { .. } => "SET super_read_only",
            ControlCommand::AcquireLock { .. } => "LOCK INSTANCE",
            ControlCommand::ReleaseLock { .. } => "UNLOCK INSTANCE",
            ControlCommand::SetVariable { .. } => "SET VARIABLE",
        }
    }
}

/// 远端节点协议
///
/// 所有调用都可能阻塞到配置的超时时间；连接失败返回 [`TopologyError::Unreachable`]。
pub trait NodeClient: Send + Sync {
    fn get_status(&self, instance: &InstanceAddress) -> Result<InstanceStatus>;

    fn apply_control(&self, instance: &InstanceAddress, command: ControlCommand) -> Result<()>;

    /// 等待 `instance` 应用完 `gtids`；超时返回 `Ok(false)`，`None` 表示不限时
    fn wait_applied(
        &self,
        instance: &InstanceAddress,
        gtids: &GtidSet,
        timeout: Option<Duration>,
    ) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parse() {
        let addr: InstanceAddress = "db-1.example:3306".parse().unwrap();
        assert_eq!(addr.host, "db-1.example");
        assert_eq!(addr.port, 3306);
        assert_eq!(addr.to_string(), "db-1.example:3306");

        assert!("db-1".parse::<InstanceAddress>().is_err());
        assert!(":3306".parse::<InstanceAddress>().is_err());
        assert!("db:0".parse::<InstanceAddress>().is_err());
        assert!("db:99999".parse::<InstanceAddress>().is_err());
    }

    #[test]
    fn test_version_parse_and_order() {
        let v: ServerVersion = "8.0.35-log".parse().unwrap();
        assert_eq!(v, ServerVersion::new(8, 0, 35));
        assert_eq!("8.0".parse::<ServerVersion>().unwrap(), ServerVersion::new(8, 0, 0));
        assert!("8.0.18".parse::<ServerVersion>().unwrap() < "8.0.19".parse().unwrap());
        assert!("abc".parse::<ServerVersion>().is_err());
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = ReplicationCredentials::generate("repl_user");
        assert_eq!(creds.password.len(), 32);
        let debug = format!("{:?}", creds);
        assert!(!debug.contains(&creds.password));
    }
}
