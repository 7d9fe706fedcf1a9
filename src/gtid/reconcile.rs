//! GTID 对账
//!
//! 比较两个节点的 GTID 集合：积压（backlog）、多余事务（errant）、
//! 以及源端已清除且目标缺失的事务（purged gap，无法增量追平）。

use std::time::Duration;

use super::GtidSet;
use crate::probe::{InstanceAddress, NodeClient};
use crate::{Result, TopologyError};

/// `b` 中有而 `a` 中没有的事务（`a` 追平 `b` 需要回放的部分）
pub fn backlog(a: &GtidSet, b: &GtidSet) -> GtidSet {
    b.subtract(a)
}

/// `a` 中有而 `b` 中没有的事务
pub fn errant(a: &GtidSet, b: &GtidSet) -> GtidSet {
    a.subtract(b)
}

/// 源端 binlog 中已清除、而目标从未执行过的事务
pub fn purged_gap(source_purged: &GtidSet, target_executed: &GtidSet) -> GtidSet {
    source_purged.subtract(target_executed)
}

pub fn is_purged_gap(source_purged: &GtidSet, target_executed: &GtidSet) -> bool {
    !purged_gap(source_purged, target_executed).is_empty()
}

/// 目标与源的一次完整比较结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GtidComparison {
    /// 目标独有的事务
    pub errant: GtidSet,
    /// 目标缺少的事务
    pub missing: GtidSet,
    /// 目标缺少且源端已清除的事务
    pub unrecoverable: GtidSet,
}

impl GtidComparison {
    pub fn compute(target: &GtidSet, source_executed: &GtidSet, source_purged: &GtidSet) -> Self {
        Self {
            errant: errant(target, source_executed),
            missing: backlog(target, source_executed),
            unrecoverable: purged_gap(source_purged, target),
        }
    }

    pub fn is_in_sync(&self) -> bool {
        self.errant.is_empty() && self.missing.is_empty()
    }

    /// 可以仅靠回放 binlog 追平
    pub fn incremental_possible(&self) -> bool {
        self.errant.is_empty() && self.unrecoverable.is_empty()
    }
}

/// 等待 `instance` 应用完 `reference` 中的全部事务
///
/// 超时返回 [`TopologyError::SyncTimeout`]，错误中包含仍缺失的事务；
/// 调用方负责回滚自己已做的变更。
pub fn wait_for_sync(
    client: &dyn NodeClient,
    instance: &InstanceAddress,
    reference: &GtidSet,
    reference_source: &str,
    timeout: Option<Duration>,
) -> Result<()> {
    if reference.is_empty() {
        return Ok(());
    }

    log::debug!(
        "[{}] Waiting to apply {} transactions from {}",
        instance,
        reference.count(),
        reference_source
    );

    if client.wait_applied(instance, reference, timeout)? {
        return Ok(());
    }

    let missing = match client.get_status(instance) {
        Ok(status) => backlog(&status.gtid_executed, reference).to_string(),
        Err(_) => reference.to_string(),
    };

    log::warn!(
        "[{}] Timed out waiting for transactions from {}; missing {}",
        instance,
        reference_source,
        missing
    );

    Err(TopologyError::SyncTimeout {
        instance: instance.to_string(),
        reference: reference_source.to_string(),
        missing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const S: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";
    const T: &str = "8a94f357-aab4-11df-86ab-c80aa9429562";

    fn set(text: &str) -> GtidSet {
        GtidSet::parse(text).unwrap()
    }

    #[test]
    fn test_subset_target_is_incremental() {
        let source = set(&format!("{S}:1-100"));
        let target = set(&format!("{S}:1-60"));
        let cmp = GtidComparison::compute(&target, &source, &GtidSet::new());
        assert!(cmp.errant.is_empty());
        assert_eq!(cmp.missing.count(), 40);
        assert!(cmp.incremental_possible());
        assert!(!cmp.is_in_sync());
    }

    #[test]
    fn test_errant_detected() {
        let source = set(&format!("{S}:1-100"));
        let target = set(&format!("{S}:1-50,{T}:1"));
        let cmp = GtidComparison::compute(&target, &source, &GtidSet::new());
        assert_eq!(cmp.errant.to_string(), format!("{T}:1"));
        assert!(!cmp.incremental_possible());
    }

    #[test]
    fn test_purged_gap() {
        let purged = set(&format!("{S}:1-80"));
        // 目标只执行到 50，51-80 已在源端清除
        let target = set(&format!("{S}:1-50"));
        assert!(is_purged_gap(&purged, &target));
        assert_eq!(purged_gap(&purged, &target).to_string(), format!("{S}:51-80"));

        let caught_up = set(&format!("{S}:1-90"));
        assert!(!is_purged_gap(&purged, &caught_up));
    }
}
