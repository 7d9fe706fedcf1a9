//! 多数派判定
//!
//! 严格多数：`online * 2 > total`。总数取最后一次已知的组视图成员数；
//! 恰好一半在线的分区没有仲裁。

use serde::Serialize;

use crate::{Result, TopologyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuorumStatus {
    pub total: usize,
    pub online: usize,
    pub has_quorum: bool,
}

impl QuorumStatus {
    pub fn evaluate(total: usize, online: usize) -> Self {
        Self {
            total,
            online,
            has_quorum: total > 0 && online * 2 > total,
        }
    }

    /// 在保持仲裁的前提下还能容忍的故障数
    pub fn tolerance(&self) -> usize {
        if !self.has_quorum {
            return 0;
        }
        (self.online - 1) / 2
    }

    /// 变更操作要求仲裁
    pub fn require(&self, operation: &str, cluster: &str) -> Result<()> {
        if self.has_quorum {
            return Ok(());
        }
        Err(TopologyError::QuorumError(format!(
            "Cannot perform {} on cluster '{}': only {} of {} members are ONLINE (a majority is required)",
            operation, cluster, self.online, self.total
        )))
    }
}
