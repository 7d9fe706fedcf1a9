//! ClusterSet 受管复制通道
//!
//! 每个副本 Cluster 在其主节点上维护一条 managed 通道，源端是主 Cluster 的当前主节点。
//! 组内换主时通道由复制层自动迁移，这里只负责建立、校验（鉴权失败时轮换密码）与拆除。

use serde::Serialize;
use std::fmt;

use crate::probe::{
    ChannelState, ControlCommand, InstanceAddress, InstanceStatus, NodeClient,
    ReplicationCredentials,
};
use crate::Result;

/// ClusterSet 通道名
pub const CLUSTERSET_CHANNEL: &str = "clusterset_replication";

/// 副本 Cluster 的通道健康度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelHealth {
    Ok,
    Stopped,
    Error,
    Missing,
    Invalidated,
}

impl fmt::Display for ChannelHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelHealth::Ok => "OK",
            ChannelHealth::Stopped => "STOPPED",
            ChannelHealth::Error => "ERROR",
            ChannelHealth::Missing => "MISSING",
            ChannelHealth::Invalidated => "INVALIDATED",
        };
        f.write_str(s)
    }
}

/// 根据副本主节点的状态判断通道健康度
pub fn channel_health(status: Option<&InstanceStatus>, invalidated: bool) -> ChannelHealth {
    if invalidated {
        return ChannelHealth::Invalidated;
    }
    let Some(channel) = status.and_then(|s| s.channel(CLUSTERSET_CHANNEL)) else {
        return ChannelHealth::Missing;
    };
    match channel.state {
        ChannelState::On if channel.last_error.is_none() => ChannelHealth::Ok,
        ChannelState::Off => ChannelHealth::Stopped,
        _ => ChannelHealth::Error,
    }
}

pub struct ChannelManager<'a> {
    client: &'a dyn NodeClient,
}

impl<'a> ChannelManager<'a> {
    pub fn new(client: &'a dyn NodeClient) -> Self {
        Self { client }
    }

    /// 在源主节点上创建通道账号
    pub fn provision_account(
        &self,
        source_primary: &InstanceAddress,
        user: &str,
    ) -> Result<ReplicationCredentials> {
        let credentials = ReplicationCredentials::generate(user);
        self.client.apply_control(
            source_primary,
            ControlCommand::CreateReplicationAccount {
                credentials: credentials.clone(),
            },
        )?;
        Ok(credentials)
    }

    /// 重新生成通道账号密码
    pub fn rotate_password(
        &self,
        source_primary: &InstanceAddress,
        user: &str,
    ) -> Result<ReplicationCredentials> {
        let credentials = ReplicationCredentials::generate(user);
        self.client.apply_control(
            source_primary,
            ControlCommand::SetReplicationPassword {
                credentials: credentials.clone(),
            },
        )?;
        log::info!("[{}] Replication password rotated for '{}'", source_primary, user);
        Ok(credentials)
    }

    pub fn drop_account(&self, source_primary: &InstanceAddress, user: &str) -> Result<()> {
        self.client.apply_control(
            source_primary,
            ControlCommand::DropReplicationAccount {
                user: user.to_string(),
            },
        )
    }

    /// 在副本主节点上（重新）建立通道并启动
    pub fn establish(
        &self,
        replica_primary: &InstanceAddress,
        source: &InstanceAddress,
        credentials: ReplicationCredentials,
    ) -> Result<()> {
        self.teardown(replica_primary)?;
        self.client.apply_control(
            replica_primary,
            ControlCommand::ChangeReplicationSource {
                channel: CLUSTERSET_CHANNEL.to_string(),
                source: source.clone(),
                credentials,
                delay: 0,
                managed: true,
            },
        )?;
        self.client.apply_control(
            replica_primary,
            ControlCommand::StartReplica {
                channel: CLUSTERSET_CHANNEL.to_string(),
            },
        )?;
        log::info!(
            "[{}] ClusterSet channel established from {}",
            replica_primary,
            source
        );
        Ok(())
    }

    pub fn teardown(&self, replica_primary: &InstanceAddress) -> Result<()> {
        self.client.apply_control(
            replica_primary,
            ControlCommand::StopReplica {
                channel: CLUSTERSET_CHANNEL.to_string(),
            },
        )?;
        self.client.apply_control(
            replica_primary,
            ControlCommand::ResetReplica {
                channel: CLUSTERSET_CHANNEL.to_string(),
            },
        )
    }

    /// 确认通道指向 `source` 且健康；鉴权失败时轮换密码后重建
    pub fn verify(
        &self,
        replica_primary: &InstanceAddress,
        source: &InstanceAddress,
        user: &str,
    ) -> Result<ChannelHealth> {
        let status = self.client.get_status(replica_primary)?;
        let needs_rebuild = match status.channel(CLUSTERSET_CHANNEL) {
            None => true,
            Some(channel) if &channel.source != source => true,
            Some(channel) => match &channel.last_error {
                Some(error) if error.is_auth_failure() => {
                    log::warn!(
                        "[{}] ClusterSet channel authentication failed ({}); regenerating credentials",
                        replica_primary,
                        error.message
                    );
                    true
                }
                _ => channel.state == ChannelState::Off,
            },
        };
        if needs_rebuild {
            let credentials = self.rotate_password(source, user)?;
            self.establish(replica_primary, source, credentials)?;
        }
        let status = self.client.get_status(replica_primary)?;
        Ok(channel_health(Some(&status), false))
    }

    /// 通道从 `from`（已离开的节点）迁移到 `to`
    pub fn rehome(
        &self,
        from: &InstanceAddress,
        to: &InstanceAddress,
        source: &InstanceAddress,
        user: &str,
    ) -> Result<()> {
        if let Err(e) = self.teardown(from) {
            log::warn!("[{}] Failed to remove the stale ClusterSet channel: {}", from, e);
        }
        let credentials = self.rotate_password(source, user)?;
        self.establish(to, source, credentials)
    }
}
