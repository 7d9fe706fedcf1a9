//! 元数据升级
//!
//! 线性迁移链 `1.0.1 → 2.0.0 → 2.1.0 → 2.2.0`。流程：
//!
//! 1. 检查已注册 Router 的版本，不满足最低版本时由操作者选择
//!    重新检查 / 注销 / 中止，绝不静默继续
//! 2. 备份当前元数据
//! 3. 标记 "upgrade in progress"，逐个版本执行迁移步骤并记录
//! 4. 全部成功后清除标记并删除备份
//!
//! 任一步骤失败时保留备份与进行中标记，重试会从已记录的版本继续。

use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;

use super::schema::{MetadataSchema, RouterId, RouterRecord, UpgradeState};
use super::store::MetadataStore;
use super::version::MetadataVersion;
use crate::interaction::InteractionPort;
use crate::probe::ServerVersion;
use crate::{Result, TopologyError};

pub const RECHECK_ROUTERS: &str = "Re-check for outdated Routers and continue with the metadata upgrade.";
pub const UNREGISTER_ROUTERS: &str = "Unregister the remaining Routers.";
pub const ABORT_UPGRADE: &str = "Abort the operation.";

/// 单个迁移步骤（必须幂等）
#[derive(Clone)]
pub struct UpgradeStep {
    pub from: MetadataVersion,
    pub to: MetadataVersion,
    pub description: &'static str,
    pub apply: fn(&mut MetadataSchema) -> Result<()>,
}

impl std::fmt::Debug for UpgradeStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UpgradeStep({} -> {}: {})", self.from, self.to, self.description)
    }
}

pub fn default_steps() -> Vec<UpgradeStep> {
    vec![
        UpgradeStep {
            from: MetadataVersion::new(1, 0, 1),
            to: MetadataVersion::new(2, 0, 0),
            description: "normalize group names and seed view ids",
            apply: step_2_0_0,
        },
        UpgradeStep {
            from: MetadataVersion::new(2, 0, 0),
            to: MetadataVersion::new(2, 1, 0),
            description: "name routers and normalize router versions",
            apply: step_2_1_0,
        },
        UpgradeStep {
            from: MetadataVersion::new(2, 1, 0),
            to: MetadataVersion::new(2, 2, 0),
            description: "move legacy attribute tags into typed tags",
            apply: step_2_2_0,
        },
    ]
}

fn step_2_0_0(schema: &mut MetadataSchema) -> Result<()> {
    for cluster in schema.clusters.values_mut() {
        cluster.group_name = cluster.group_name.to_ascii_lowercase();
        cluster.view_id = cluster.view_id.max(1);
    }
    for rs in schema.replicasets.values_mut() {
        rs.view_id = rs.view_id.max(1);
    }
    Ok(())
}

fn step_2_1_0(schema: &mut MetadataSchema) -> Result<()> {
    for router in schema.routers.values_mut() {
        if router.name.is_none() {
            router.name = Some("system".to_string());
        }
        if let Ok(version) = router.version.parse::<ServerVersion>() {
            router.version = version.to_string();
        }
    }
    Ok(())
}

fn step_2_2_0(schema: &mut MetadataSchema) -> Result<()> {
    fn move_tags(attributes: &mut BTreeMap<String, Value>, tags: &mut BTreeMap<String, Value>) {
        if let Some(Value::Object(legacy)) = attributes.remove("tags") {
            for (k, v) in legacy {
                tags.entry(k).or_insert(v);
            }
        }
    }
    for cluster in schema.clusters.values_mut() {
        move_tags(&mut cluster.attributes, &mut cluster.tags);
    }
    for rs in schema.replicasets.values_mut() {
        move_tags(&mut rs.attributes, &mut rs.tags);
    }
    for instance in schema.instances.values_mut() {
        move_tags(&mut instance.attributes, &mut instance.tags);
    }
    Ok(())
}

/// 版本低于 `floor`（或无法解析）的 Router
pub fn outdated_routers(schema: &MetadataSchema, floor: ServerVersion) -> Vec<RouterRecord> {
    schema
        .routers
        .values()
        .filter(|r| {
            r.version
                .parse::<ServerVersion>()
                .map(|v| v < floor)
                .unwrap_or(true)
        })
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct UpgradeReport {
    pub from: Option<MetadataVersion>,
    pub to: Option<MetadataVersion>,
    pub dry_run: bool,
    pub resumed: bool,
    pub steps_applied: Vec<MetadataVersion>,
    /// dry run 时列出需要升级的 Router
    pub outdated_routers: Vec<String>,
    pub unregistered_routers: Vec<String>,
}

pub struct MetadataUpgrader<'a> {
    store: &'a MetadataStore,
    port: &'a dyn InteractionPort,
    router_floor: ServerVersion,
    steps: Vec<UpgradeStep>,
}

impl<'a> MetadataUpgrader<'a> {
    pub fn new(store: &'a MetadataStore, port: &'a dyn InteractionPort, router_floor: ServerVersion) -> Self {
        Self {
            store,
            port,
            router_floor,
            steps: default_steps(),
        }
    }

    /// 替换迁移步骤
    pub fn with_steps(mut self, steps: Vec<UpgradeStep>) -> Self {
        self.steps = steps;
        self
    }

    /// 从 `version` 到引擎版本需要执行的步骤
    fn plan(&self, version: MetadataVersion) -> Result<Vec<UpgradeStep>> {
        let mut plan = Vec::new();
        let mut current = version;
        while current < MetadataVersion::ENGINE {
            let step = self
                .steps
                .iter()
                .find(|s| s.from == current)
                .ok_or_else(|| {
                    TopologyError::MetadataVersion(format!(
                        "No upgrade path from metadata version {} to {}",
                        current,
                        MetadataVersion::ENGINE
                    ))
                })?;
            plan.push(step.clone());
            current = step.to;
        }
        Ok(plan)
    }

    /// 检查 Router 版本；dry run 且仍有过旧 Router 时返回 false
    fn check_routers(&self, dry_run: bool, report: &mut UpgradeReport) -> Result<bool> {
        loop {
            let outdated = self.store.read(|s| outdated_routers(s, self.router_floor));
            if outdated.is_empty() {
                return Ok(true);
            }

            let labels: Vec<String> = outdated
                .iter()
                .map(|r| format!("{} (version {})", r.label(), r.version))
                .collect();
            log::warn!(
                "{} Router(s) must be upgraded to at least {} before the metadata upgrade: {}",
                outdated.len(),
                self.router_floor,
                labels.join(", ")
            );

            if dry_run {
                report.outdated_routers = labels;
                return Ok(false);
            }

            if !self.port.is_interactive() {
                return Err(TopologyError::MetadataVersion(format!(
                    "The following Routers must be upgraded to at least {} before upgrading the metadata: {}",
                    self.router_floor,
                    labels.join(", ")
                )));
            }

            let question = format!(
                "The following Routers require an upgrade before the metadata upgrade can continue:\n  {}\nPlease select an option:",
                labels.join("\n  ")
            );
            let options = vec![
                RECHECK_ROUTERS.to_string(),
                UNREGISTER_ROUTERS.to_string(),
                ABORT_UPGRADE.to_string(),
            ];
            match self.port.select(&question, &options, 0)? {
                0 => continue,
                1 => {
                    let ids: Vec<RouterId> = outdated.iter().map(|r| r.id.clone()).collect();
                    self.store.update(|s| {
                        for id in &ids {
                            s.routers.remove(id);
                        }
                        Ok(())
                    })?;
                    log::info!("Unregistered {} outdated Router(s)", ids.len());
                    report.unregistered_routers.extend(labels);
                }
                _ => {
                    return Err(TopologyError::Cancelled(
                        "Metadata upgrade aborted by the user".to_string(),
                    ))
                }
            }
        }
    }

    pub fn run(&self, dry_run: bool) -> Result<UpgradeReport> {
        let snapshot = self.store.snapshot();
        let resuming = snapshot.upgrade != UpgradeState::Idle;
        let mut report = UpgradeReport {
            from: Some(snapshot.version),
            to: Some(MetadataVersion::ENGINE),
            dry_run,
            resumed: resuming,
            ..Default::default()
        };

        if snapshot.version > MetadataVersion::ENGINE {
            return Err(TopologyError::MetadataVersion(format!(
                "Metadata version {} is newer than the engine ({}); it cannot be downgraded",
                snapshot.version,
                MetadataVersion::ENGINE
            )));
        }
        if snapshot.version < MetadataVersion::LEGACY {
            return Err(TopologyError::MetadataVersion(format!(
                "Metadata version {} is too old to be upgraded (minimum {})",
                snapshot.version,
                MetadataVersion::LEGACY
            )));
        }
        if snapshot.version == MetadataVersion::ENGINE && !resuming {
            log::info!("Metadata is already at version {}", snapshot.version);
            return Ok(report);
        }

        let plan = self.plan(snapshot.version)?;

        if !self.check_routers(dry_run, &mut report)? || dry_run {
            log::info!(
                "Dry run: {} upgrade step(s) from {} would be applied",
                plan.len(),
                snapshot.version
            );
            return Ok(report);
        }

        if !resuming || !self.store.has_backup() {
            self.store.create_backup()?;
            log::info!("Metadata backup created");
        } else {
            log::info!("Resuming interrupted metadata upgrade from {}", snapshot.version);
        }

        self.store.update(|s| {
            if s.upgrade == UpgradeState::Idle {
                s.upgrade = UpgradeState::InProgress {
                    from: s.version,
                    to: MetadataVersion::ENGINE,
                    started_at: Utc::now(),
                    completed: Vec::new(),
                };
            }
            Ok(())
        })?;

        for step in &plan {
            log::info!("Upgrading metadata {} -> {} ({})", step.from, step.to, step.description);
            self.store.update(|s| {
                if s.version >= step.to {
                    return Ok(());
                }
                (step.apply)(s)?;
                s.version = step.to;
                if let UpgradeState::InProgress { completed, .. } = &mut s.upgrade {
                    completed.push(step.to);
                }
                Ok(())
            })
            .map_err(|e| {
                log::error!(
                    "Metadata upgrade step {} -> {} failed: {}; backup kept for retry",
                    step.from,
                    step.to,
                    e
                );
                e
            })?;
            report.steps_applied.push(step.to);
        }

        self.store.update(|s| {
            s.upgrade = UpgradeState::Idle;
            Ok(())
        })?;
        self.store.drop_backup()?;
        log::info!("Metadata upgraded to {}", MetadataVersion::ENGINE);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interaction::{NonInteractive, ScriptedAnswer, ScriptedInteraction};
    use crate::metadata::schema::ClusterId;
    use crate::metadata::schema::ClusterRecord;

    fn legacy_store() -> MetadataStore {
        let mut schema = MetadataSchema::new(MetadataVersion::LEGACY);
        let id = ClusterId::generate();
        let mut attributes = BTreeMap::new();
        attributes.insert("tags".to_string(), serde_json::json!({"env": "prod"}));
        schema.clusters.insert(
            id.clone(),
            ClusterRecord {
                id,
                name: "legacy".to_string(),
                group_name: "AAAAAAAA-BBBB-CCCC-DDDD-EEEEEEEEEEEE".to_string(),
                view_change_uuid: None,
                single_primary: true,
                created_at: Utc::now(),
                view_id: 0,
                disable_clone: false,
                gtid_set_complete: false,
                options: BTreeMap::new(),
                tags: BTreeMap::new(),
                attributes,
                clusterset: None,
            },
        );
        MetadataStore::with_schema(schema)
    }

    fn floor() -> ServerVersion {
        ServerVersion::new(8, 0, 19)
    }

    #[test]
    fn test_full_upgrade_applies_every_step() {
        let store = legacy_store();
        let report = MetadataUpgrader::new(&store, &NonInteractive, floor()).run(false).unwrap();
        assert_eq!(report.steps_applied.len(), 3);
        let schema = store.snapshot();
        assert_eq!(schema.version, MetadataVersion::ENGINE);
        assert_eq!(schema.upgrade, UpgradeState::Idle);
        let cluster = schema.cluster_by_name("legacy").unwrap();
        assert_eq!(cluster.group_name, "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee");
        assert_eq!(cluster.tags["env"], serde_json::json!("prod"));
        assert!(!cluster.attributes.contains_key("tags"));
        assert!(!store.has_backup());
    }

    #[test]
    fn test_outdated_router_blocks_non_interactive() {
        let store = legacy_store();
        store
            .update(|s| {
                s.register_router("r1", "app1", "8.0.18", None);
                Ok(())
            })
            .unwrap();
        let err = MetadataUpgrader::new(&store, &NonInteractive, floor()).run(false).unwrap_err();
        assert!(err.to_string().contains("app1::r1"));
        // 没有做任何修改
        assert_eq!(store.version(), MetadataVersion::LEGACY);
        assert!(!store.has_backup());
    }

    #[test]
    fn test_abort_choice_cancels() {
        let store = legacy_store();
        store
            .update(|s| {
                s.register_router("r1", "app1", "8.0.18", None);
                Ok(())
            })
            .unwrap();
        let port = ScriptedInteraction::new(vec![ScriptedAnswer::Choose("Abort".to_string())]);
        let err = MetadataUpgrader::new(&store, &port, floor()).run(false).unwrap_err();
        assert!(matches!(err, TopologyError::Cancelled(_)));
        assert_eq!(store.version(), MetadataVersion::LEGACY);
    }

    fn failing_step(_: &mut MetadataSchema) -> Result<()> {
        Err(TopologyError::InternalError("simulated failure".to_string()))
    }

    #[test]
    fn test_failed_step_keeps_backup_and_resumes() {
        let store = legacy_store();
        let mut steps = default_steps();
        steps[1].apply = failing_step;

        let err = MetadataUpgrader::new(&store, &NonInteractive, floor())
            .with_steps(steps)
            .run(false);
        assert!(err.is_err());
        assert!(store.has_backup());
        assert_eq!(store.version(), MetadataVersion::new(2, 0, 0));
        assert!(store.ensure_writable().is_err());

        let report = MetadataUpgrader::new(&store, &NonInteractive, floor()).run(false).unwrap();
        assert!(report.resumed);
        assert_eq!(report.steps_applied, vec![MetadataVersion::new(2, 1, 0), MetadataVersion::new(2, 2, 0)]);
        assert_eq!(store.version(), MetadataVersion::ENGINE);
        assert!(!store.has_backup());
        assert!(store.ensure_writable().is_ok());
    }

    #[test]
    fn test_steps_are_idempotent() {
        let store = legacy_store();
        let mut schema = store.snapshot();
        for step in default_steps() {
            (step.apply)(&mut schema).unwrap();
            let once = serde_json::to_value(&schema).unwrap();
            (step.apply)(&mut schema).unwrap();
            assert_eq!(once, serde_json::to_value(&schema).unwrap());
        }
    }
}
