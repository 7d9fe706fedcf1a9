//! 元数据存储
//!
//! 单一事实来源。所有写入走乐观事务：`begin` 取快照与修订号，`commit` 时
//! 修订号不一致则返回 [`TopologyError::MetadataConflict`]，调用方必须重新读取拓扑。
//!
//! 持久化格式：带 CRC32 校验的 JSON 信封，写入使用临时文件 + rename。

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use super::schema::MetadataSchema;
use super::version::{Compatibility, MetadataVersion};
use crate::{Result, TopologyError};

/// 持久化信封
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    crc32: u32,
    payload: String,
}

/// 未提交的元数据事务
pub struct MetadataTransaction {
    base_revision: u64,
    pub schema: MetadataSchema,
}

impl MetadataTransaction {
    pub fn base_revision(&self) -> u64 {
        self.base_revision
    }
}

/// 拓扑级操作锁（RAII）
pub struct OperationLock<'a> {
    locks: &'a DashMap<String, String>,
    key: String,
}

impl Drop for OperationLock<'_> {
    fn drop(&mut self) {
        self.locks.remove(&self.key);
    }
}

pub struct MetadataStore {
    schema: RwLock<MetadataSchema>,
    path: Option<PathBuf>,
    backup_suffix: String,
    backup: Mutex<Option<MetadataSchema>>,
    max_retries: usize,
    /// 正在运行的拓扑操作：topology key -> operation
    operations: DashMap<String, String>,
}

impl MetadataStore {
    /// 纯内存存储（当前引擎版本）
    pub fn in_memory() -> Self {
        Self::with_schema(MetadataSchema::default())
    }

    pub fn with_schema(schema: MetadataSchema) -> Self {
        Self {
            schema: RwLock::new(schema),
            path: None,
            backup_suffix: "backup".to_string(),
            backup: Mutex::new(None),
            max_retries: 3,
            operations: DashMap::new(),
        }
    }

    /// 打开持久化存储；文件不存在时以当前引擎版本初始化
    pub fn open<P: AsRef<Path>>(path: P, backup_suffix: &str, max_retries: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let schema = if path.exists() {
            load_envelope(&path)?
        } else {
            log::info!("Initializing new metadata store at {}", path.display());
            let schema = MetadataSchema::default();
            save_envelope(&path, &schema)?;
            schema
        };

        let backup_path = backup_path(&path, backup_suffix);
        let backup = if backup_path.exists() {
            log::warn!(
                "Found metadata backup at {}; a previous upgrade did not finish",
                backup_path.display()
            );
            Some(load_envelope(&backup_path)?)
        } else {
            None
        };

        Ok(Self {
            schema: RwLock::new(schema),
            path: Some(path),
            backup_suffix: backup_suffix.to_string(),
            backup: Mutex::new(backup),
            max_retries: max_retries.max(1),
            operations: DashMap::new(),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn version(&self) -> MetadataVersion {
        self.schema.read().version
    }

    pub fn revision(&self) -> u64 {
        self.schema.read().revision
    }

    /// 当前元数据的完整快照
    pub fn snapshot(&self) -> MetadataSchema {
        self.schema.read().clone()
    }

    /// 在读锁内执行只读访问
    pub fn read<T>(&self, f: impl FnOnce(&MetadataSchema) -> T) -> T {
        f(&self.schema.read())
    }

    // ═══════════════════════════════════════════════════════════════════
    // 事务
    // ═══════════════════════════════════════════════════════════════════

    pub fn begin(&self) -> MetadataTransaction {
        let schema = self.schema.read().clone();
        MetadataTransaction {
            base_revision: schema.revision,
            schema,
        }
    }

    /// 提交事务，返回新的修订号
    pub fn commit(&self, tx: MetadataTransaction) -> Result<u64> {
        let mut current = self.schema.write();
        if current.revision != tx.base_revision {
            crate::record_metadata_commit!("conflict");
            return Err(TopologyError::MetadataConflict(format!(
                "metadata changed concurrently (expected revision {}, found {})",
                tx.base_revision, current.revision
            )));
        }

        let mut next = tx.schema;
        next.revision = tx.base_revision + 1;
        if let Some(path) = &self.path {
            save_envelope(path, &next)?;
        }
        *current = next;
        crate::record_metadata_commit!("ok");
        log::debug!("Metadata committed at revision {}", current.revision);
        Ok(current.revision)
    }

    /// 读取-修改-提交，冲突时重新读取并重试
    pub fn update<T>(&self, mut f: impl FnMut(&mut MetadataSchema) -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut tx = self.begin();
            let value = f(&mut tx.schema)?;
            match self.commit(tx) {
                Ok(_) => return Ok(value),
                Err(TopologyError::MetadataConflict(msg)) if attempt < self.max_retries => {
                    log::warn!("Metadata conflict ({}), retrying ({}/{})", msg, attempt, self.max_retries);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 获取拓扑级操作锁，同一拓扑上同时只允许一个变更操作
    pub fn lock_topology(&self, key: &str, operation: &str) -> Result<OperationLock<'_>> {
        use dashmap::mapref::entry::Entry;
        match self.operations.entry(key.to_string()) {
            Entry::Occupied(existing) => Err(TopologyError::InvalidState(format!(
                "Another operation ({}) is already in progress on {}",
                existing.get(),
                key
            ))),
            Entry::Vacant(slot) => {
                slot.insert(operation.to_string());
                Ok(OperationLock {
                    locks: &self.operations,
                    key: key.to_string(),
                })
            }
        }
    }

    /// 只读操作总是允许；变更操作要求版本兼容且没有进行中的升级
    pub fn ensure_writable(&self) -> Result<()> {
        let schema = self.schema.read();
        if schema.upgrade != super::schema::UpgradeState::Idle {
            return Err(TopologyError::MetadataVersion(format!(
                "A metadata upgrade from {} is in progress; run upgradeMetadata() to finish it",
                schema.version
            )));
        }
        match schema.version.compatibility() {
            Compatibility::Compatible => Ok(()),
            Compatibility::NeedsUpgrade => Err(TopologyError::MetadataVersion(format!(
                "Metadata version {} is older than the supported {}; only read-only operations are allowed until upgradeMetadata() is run",
                schema.version,
                MetadataVersion::ENGINE
            ))),
            Compatibility::NewerThanEngine => Err(TopologyError::MetadataVersion(format!(
                "Metadata version {} was written by a newer engine (supported {}); only read-only operations are allowed",
                schema.version,
                MetadataVersion::ENGINE
            ))),
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // 备份
    // ═══════════════════════════════════════════════════════════════════

    pub fn create_backup(&self) -> Result<()> {
        let snapshot = self.snapshot();
        if let Some(path) = &self.path {
            save_envelope(&backup_path(path, &self.backup_suffix), &snapshot)?;
        }
        *self.backup.lock() = Some(snapshot);
        Ok(())
    }

    pub fn has_backup(&self) -> bool {
        self.backup.lock().is_some()
    }

    pub fn backup(&self) -> Option<MetadataSchema> {
        self.backup.lock().clone()
    }

    pub fn drop_backup(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let backup = backup_path(path, &self.backup_suffix);
            if backup.exists() {
                fs::remove_file(&backup)?;
            }
        }
        *self.backup.lock() = None;
        Ok(())
    }
}

fn backup_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{}", suffix));
    path.with_file_name(name)
}

fn load_envelope(path: &Path) -> Result<MetadataSchema> {
    let mut content = String::new();
    File::open(path)
        .and_then(|mut f| f.read_to_string(&mut content))
        .map_err(|e| TopologyError::IOError(format!("Read metadata file {} failed: {}", path.display(), e)))?;

    let envelope: Envelope = serde_json::from_str(&content)?;
    let crc = crc32fast::hash(envelope.payload.as_bytes());
    if crc != envelope.crc32 {
        return Err(TopologyError::SerializationError(format!(
            "Metadata file {} is corrupt (crc {:08x} != {:08x})",
            path.display(),
            crc,
            envelope.crc32
        )));
    }
    Ok(serde_json::from_str(&envelope.payload)?)
}

/// 原子写入：临时文件 + fsync + rename
fn save_envelope(path: &Path, schema: &MetadataSchema) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let payload = serde_json::to_string_pretty(schema)?;
    let envelope = Envelope {
        crc32: crc32fast::hash(payload.as_bytes()),
        payload,
    };
    let json = serde_json::to_string(&envelope)?;

    let tmp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;
    file.write_all(json.as_bytes())?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::schema::{ClusterId, ClusterRecord};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn add_cluster(schema: &mut MetadataSchema, name: &str) {
        let id = ClusterId::generate();
        schema.clusters.insert(
            id.clone(),
            ClusterRecord {
                id,
                name: name.to_string(),
                group_name: uuid::Uuid::new_v4().to_string(),
                view_change_uuid: None,
                single_primary: true,
                created_at: Utc::now(),
                view_id: 0,
                disable_clone: false,
                gtid_set_complete: false,
                options: BTreeMap::new(),
                tags: BTreeMap::new(),
                attributes: BTreeMap::new(),
                clusterset: None,
            },
        );
    }

    #[test]
    fn test_conflicting_commit_rejected() {
        let store = MetadataStore::in_memory();
        let mut tx1 = store.begin();
        let mut tx2 = store.begin();
        add_cluster(&mut tx1.schema, "a");
        add_cluster(&mut tx2.schema, "b");

        assert_eq!(store.commit(tx1).unwrap(), 1);
        let err = store.commit(tx2).unwrap_err();
        assert!(matches!(err, TopologyError::MetadataConflict(_)));
        // 失败的事务不能覆盖已提交的数据
        assert!(store.read(|s| s.cluster_by_name("a").is_some() && s.cluster_by_name("b").is_none()));
    }

    #[test]
    fn test_update_retries_on_fresh_snapshot() {
        let store = MetadataStore::in_memory();
        let mut calls = 0;
        store
            .update(|schema| {
                calls += 1;
                if calls == 1 {
                    // 模拟并发写入
                    let mut other = store.begin();
                    add_cluster(&mut other.schema, "other");
                    store.commit(other)?;
                }
                add_cluster(schema, &format!("mine{}", calls));
                Ok(())
            })
            .unwrap();
        assert_eq!(calls, 2);
        assert!(store.read(|s| s.cluster_by_name("other").is_some() && s.cluster_by_name("mine2").is_some()));
    }

    #[test]
    fn test_operation_lock_is_exclusive() {
        let store = MetadataStore::in_memory();
        let guard = store.lock_topology("cluster:1", "addInstance").unwrap();
        let err = store.lock_topology("cluster:1", "removeInstance").err().unwrap();
        assert!(err.to_string().contains("addInstance"));
        assert!(store.lock_topology("cluster:2", "rescan").is_ok());
        drop(guard);
        assert!(store.lock_topology("cluster:1", "removeInstance").is_ok());
    }

    #[test]
    fn test_persisted_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        {
            let store = MetadataStore::open(&path, "backup", 3).unwrap();
            store.update(|s| {
                add_cluster(s, "persisted");
                Ok(())
            })
            .unwrap();
        }
        let reopened = MetadataStore::open(&path, "backup", 3).unwrap();
        assert!(reopened.read(|s| s.cluster_by_name("persisted").is_some()));
        assert_eq!(reopened.revision(), 1);
    }

    #[test]
    fn test_corrupt_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        MetadataStore::open(&path, "backup", 3).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let mut envelope: serde_json::Value = serde_json::from_str(&content).unwrap();
        envelope["crc32"] = serde_json::json!(1);
        fs::write(&path, envelope.to_string()).unwrap();

        let err = MetadataStore::open(&path, "backup", 3).err().unwrap();
        assert!(matches!(err, TopologyError::SerializationError(_)));
    }

    #[test]
    fn test_backup_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        let store = MetadataStore::open(&path, "bak", 3).unwrap();
        store.create_backup().unwrap();
        assert!(dir.path().join("metadata.json.bak").exists());

        let reopened = MetadataStore::open(&path, "bak", 3).unwrap();
        assert!(reopened.has_backup());
        reopened.drop_backup().unwrap();
        assert!(!dir.path().join("metadata.json.bak").exists());
    }

    #[test]
    fn test_old_version_is_read_only() {
        let store = MetadataStore::with_schema(MetadataSchema::new(MetadataVersion::LEGACY));
        assert!(matches!(store.ensure_writable(), Err(TopologyError::MetadataVersion(_))));
        assert!(MetadataStore::in_memory().ensure_writable().is_ok());
    }
}
