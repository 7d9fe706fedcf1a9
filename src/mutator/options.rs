//! 拓扑与实例选项
//!
//! `setOption` / `setInstanceOption` 的键解析与类型校验。`tag:<name>` 命名空间存放
//! 任意标量标签；`_` 开头的标签名保留给内置标签，内置标签带类型约束。

use serde_json::Value;
use std::collections::BTreeMap;

use crate::{Result, TopologyError};

/// 内置 Bool 标签
pub const BUILTIN_BOOL_TAGS: &[&str] = &["_hidden", "_disconnect_existing_sessions_when_hidden"];

const TAG_PREFIX: &str = "tag:";

const CONSISTENCY_LEVELS: &[&str] = &[
    "EVENTUAL",
    "BEFORE_ON_PRIMARY_FAILOVER",
    "BEFORE",
    "AFTER",
    "BEFORE_AND_AFTER",
];

const EXIT_STATE_ACTIONS: &[&str] = &["ABORT_SERVER", "READ_ONLY", "OFFLINE_MODE"];

/// 解析后的 Cluster 级选项
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterOption {
    ClusterName(String),
    DisableClone(bool),
    /// 下发到所有成员的组复制变量
    Variable {
        key: &'static str,
        variable: &'static str,
        value: Value,
    },
    /// None 表示删除
    Tag { name: String, value: Option<Value> },
}

/// 解析后的实例级选项
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceOption {
    Label(String),
    Variable {
        key: &'static str,
        variable: &'static str,
        value: Value,
    },
    Tag { name: String, value: Option<Value> },
}

impl ClusterOption {
    pub fn parse(key: &str, value: &Value) -> Result<Self> {
        if let Some(name) = tag_name(key)? {
            return Ok(ClusterOption::Tag {
                value: coerce_tag(&name, value)?,
                name,
            });
        }
        match key {
            "clusterName" => {
                let name = expect_string(key, value)?;
                super::validate_name("Cluster", &name)?;
                Ok(ClusterOption::ClusterName(name))
            }
            "disableClone" => Ok(ClusterOption::DisableClone(expect_bool(key, value)?)),
            _ => match group_variable(key, value)? {
                Some((key, variable, value)) => Ok(ClusterOption::Variable { key, variable, value }),
                None => Err(TopologyError::ArgumentError(format!(
                    "Option '{}' not supported",
                    key
                ))),
            },
        }
    }
}

impl InstanceOption {
    pub fn parse(key: &str, value: &Value) -> Result<Self> {
        if let Some(name) = tag_name(key)? {
            return Ok(InstanceOption::Tag {
                value: coerce_tag(&name, value)?,
                name,
            });
        }
        if key == "label" {
            let label = expect_string(key, value)?;
            if label.is_empty() {
                return Err(TopologyError::ArgumentError("The label can not be empty".to_string()));
            }
            return Ok(InstanceOption::Label(label));
        }
        match group_variable(key, value)? {
            Some((key, variable, value)) if key != "expelTimeout" && key != "consistency" => {
                Ok(InstanceOption::Variable { key, variable, value })
            }
            _ => Err(TopologyError::ArgumentError(format!(
                "Option '{}' not supported",
                key
            ))),
        }
    }
}

/// `tag:<name>` 键；非标签键返回 None
pub fn tag_name(key: &str) -> Result<Option<String>> {
    let Some(name) = key.strip_prefix(TAG_PREFIX) else {
        return Ok(None);
    };
    let valid = !name.is_empty()
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false)
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(TopologyError::ArgumentError(format!(
            "'{}' is not a valid tag identifier",
            name
        )));
    }
    if name.starts_with('_') && !BUILTIN_BOOL_TAGS.contains(&name) {
        return Err(TopologyError::ArgumentError(format!(
            "'{}' is not a valid built-in tag; tags starting with '_' are reserved",
            name
        )));
    }
    Ok(Some(name.to_string()))
}

/// 标签值校验与类型转换；null 表示删除
pub fn coerce_tag(name: &str, value: &Value) -> Result<Option<Value>> {
    if value.is_null() {
        return Ok(None);
    }
    if BUILTIN_BOOL_TAGS.contains(&name) {
        return Ok(Some(Value::Bool(coerce_bool(value).ok_or_else(|| {
            TopologyError::TypeError(format!(
                "Built-in tag '{}' is expected to be of type Bool, but is {}",
                name,
                type_name(value)
            ))
        })?)));
    }
    match value {
        Value::Array(_) | Value::Object(_) => Err(TopologyError::TypeError(format!(
            "Tag '{}' must be a scalar value, but is {}",
            name,
            type_name(value)
        ))),
        scalar => Ok(Some(scalar.clone())),
    }
}

/// 写入或删除标签；删除不存在的标签不是错误
pub fn apply_tag(tags: &mut BTreeMap<String, Value>, name: &str, value: Option<Value>) {
    match value {
        Some(v) => {
            tags.insert(name.to_string(), v);
        }
        None => {
            tags.remove(name);
        }
    }
}

/// 选项值转成服务器变量的字符串形式
pub fn variable_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════
// 类型转换
// ═══════════════════════════════════════════════════════════════════

fn group_variable(key: &str, value: &Value) -> Result<Option<(&'static str, &'static str, Value)>> {
    let parsed = match key {
        "expelTimeout" => (
            "expelTimeout",
            "group_replication_member_expel_timeout",
            Value::from(expect_int_in(key, value, 0, 3600)?),
        ),
        "consistency" => (
            "consistency",
            "group_replication_consistency",
            Value::from(expect_enum(key, value, CONSISTENCY_LEVELS)?),
        ),
        "memberWeight" => (
            "memberWeight",
            "group_replication_member_weight",
            Value::from(expect_int_in(key, value, 0, 100)?),
        ),
        "exitStateAction" => (
            "exitStateAction",
            "group_replication_exit_state_action",
            Value::from(expect_enum(key, value, EXIT_STATE_ACTIONS)?),
        ),
        "autoRejoinTries" => (
            "autoRejoinTries",
            "group_replication_autorejoin_tries",
            Value::from(expect_int_in(key, value, 0, 2016)?),
        ),
        _ => return Ok(None),
    };
    Ok(Some(parsed))
}

fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Integer",
        Value::Number(_) => "Float",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Map",
    }
}

fn expect_bool(key: &str, value: &Value) -> Result<bool> {
    coerce_bool(value).ok_or_else(|| {
        TopologyError::TypeError(format!(
            "Option '{}' is expected to be of type Bool, but is {}",
            key,
            type_name(value)
        ))
    })
}

fn expect_string(key: &str, value: &Value) -> Result<String> {
    value.as_str().map(|s| s.to_string()).ok_or_else(|| {
        TopologyError::TypeError(format!(
            "Option '{}' is expected to be of type String, but is {}",
            key,
            type_name(value)
        ))
    })
}

fn expect_int_in(key: &str, value: &Value, min: i64, max: i64) -> Result<i64> {
    let n = value.as_i64().ok_or_else(|| {
        TopologyError::TypeError(format!(
            "Option '{}' is expected to be of type Integer, but is {}",
            key,
            type_name(value)
        ))
    })?;
    if !(min..=max).contains(&n) {
        return Err(TopologyError::ArgumentError(format!(
            "Invalid value for '{}': {} (supported range {}..{})",
            key, n, min, max
        )));
    }
    Ok(n)
}

fn expect_enum(key: &str, value: &Value, allowed: &[&str]) -> Result<String> {
    let s = expect_string(key, value)?.to_ascii_uppercase();
    if !allowed.contains(&s.as_str()) {
        return Err(TopologyError::ArgumentError(format!(
            "Invalid value for '{}': '{}'; accepted values: {}",
            key,
            s,
            allowed.join(", ")
        )));
    }
    Ok(s)
}
