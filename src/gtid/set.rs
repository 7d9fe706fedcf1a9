//! GTID 集合
//!
//! 文本格式与服务器一致：`uuid:1-5:7,uuid2:1-3`。内部按 uuid 保存有序、
//! 合并后的闭区间列表，所有集合运算的结果都保持规范形式。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::{Result, TopologyError};

/// 闭区间 `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GtidInterval {
    pub start: u64,
    pub end: u64,
}

/// 服务端 GNO 为有符号 64 位，区间端点不超过该值
pub const MAX_GNO: u64 = i64::MAX as u64;

impl GtidInterval {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// GTID 集合
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct GtidSet {
    sets: BTreeMap<String, Vec<GtidInterval>>,
}

impl GtidSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Result<Self> {
        text.parse()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// 事务总数
    pub fn count(&self) -> u64 {
        self.sets
            .values()
            .flat_map(|ivs| ivs.iter())
            .map(|iv| iv.len())
            .fold(0u64, u64::saturating_add)
    }

    pub fn uuids(&self) -> impl Iterator<Item = &str> {
        self.sets.keys().map(|s| s.as_str())
    }

    pub fn intervals(&self, uuid: &str) -> &[GtidInterval] {
        self.sets
            .get(&uuid.to_ascii_lowercase())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// 某个 uuid 下最大的事务号
    pub fn last_gno(&self, uuid: &str) -> Option<u64> {
        self.intervals(uuid).last().map(|iv| iv.end)
    }

    pub fn contains(&self, uuid: &str, gno: u64) -> bool {
        self.intervals(uuid)
            .iter()
            .any(|iv| iv.start <= gno && gno <= iv.end)
    }

    /// 加入一个区间（自动合并相邻/重叠区间）
    pub fn add_interval(&mut self, uuid: &str, start: u64, end: u64) {
        let end = end.min(MAX_GNO);
        if start == 0 || end < start {
            return;
        }
        let key = uuid.to_ascii_lowercase();
        let intervals = self.sets.entry(key).or_default();
        intervals.push(GtidInterval::new(start, end));
        normalize(intervals);
    }

    pub fn add(&mut self, uuid: &str, gno: u64) {
        self.add_interval(uuid, gno, gno);
    }

    pub fn union(&self, other: &GtidSet) -> GtidSet {
        let mut result = self.clone();
        for (uuid, intervals) in &other.sets {
            let entry = result.sets.entry(uuid.clone()).or_default();
            entry.extend(intervals.iter().copied());
            normalize(entry);
        }
        result
    }

    /// `self - other`
    pub fn subtract(&self, other: &GtidSet) -> GtidSet {
        let mut result = GtidSet::new();
        for (uuid, intervals) in &self.sets {
            let remaining = match other.sets.get(uuid) {
                Some(removed) => subtract_intervals(intervals, removed),
                None => intervals.clone(),
            };
            if !remaining.is_empty() {
                result.sets.insert(uuid.clone(), remaining);
            }
        }
        result
    }

    pub fn intersection(&self, other: &GtidSet) -> GtidSet {
        self.subtract(&self.subtract(other))
    }

    pub fn is_subset_of(&self, other: &GtidSet) -> bool {
        self.subtract(other).is_empty()
    }

    /// 去掉某个 uuid 的全部事务（例如组复制视图变更事件）
    pub fn without_uuid(&self, uuid: &str) -> GtidSet {
        let mut result = self.clone();
        result.sets.remove(&uuid.to_ascii_lowercase());
        result
    }
}

fn normalize(intervals: &mut Vec<GtidInterval>) {
    intervals.sort();
    let mut merged: Vec<GtidInterval> = Vec::with_capacity(intervals.len());
    for iv in intervals.drain(..) {
        match merged.last_mut() {
            Some(last) if iv.start <= last.end.saturating_add(1) => {
                last.end = last.end.max(iv.end);
            }
            _ => merged.push(iv),
        }
    }
    *intervals = merged;
}

fn subtract_intervals(base: &[GtidInterval], removed: &[GtidInterval]) -> Vec<GtidInterval> {
    let mut result = Vec::new();
    for iv in base {
        let mut start = iv.start;
        let end = iv.end;
        for r in removed {
            if r.end < start || r.start > end {
                continue;
            }
            if r.start > start {
                result.push(GtidInterval::new(start, r.start - 1));
            }
            if r.end >= end {
                start = end + 1;
                break;
            }
            start = r.end + 1;
        }
        if start <= end {
            result.push(GtidInterval::new(start, end));
        }
    }
    result
}

impl FromStr for GtidSet {
    type Err = TopologyError;

    fn from_str(text: &str) -> Result<Self> {
        let mut set = GtidSet::new();
        for part in text.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let mut fields = part.split(':');
            let uuid = fields.next().unwrap_or_default().trim();
            uuid::Uuid::parse_str(uuid).map_err(|e| {
                TopologyError::ArgumentError(format!("Invalid GTID set '{}': bad uuid '{}': {}", text, uuid, e))
            })?;
            let mut has_interval = false;
            for range in fields {
                has_interval = true;
                let range = range.trim();
                let (start, end) = match range.split_once('-') {
                    Some((a, b)) => (parse_gno(text, a)?, parse_gno(text, b)?),
                    None => {
                        let gno = parse_gno(text, range)?;
                        (gno, gno)
                    }
                };
                if start == 0 || end < start {
                    return Err(TopologyError::ArgumentError(format!(
                        "Invalid GTID set '{}': bad interval '{}'",
                        text, range
                    )));
                }
                set.add_interval(uuid, start, end);
            }
            if !has_interval {
                return Err(TopologyError::ArgumentError(format!(
                    "Invalid GTID set '{}': uuid '{}' has no interval",
                    text, uuid
                )));
            }
        }
        Ok(set)
    }
}

fn parse_gno(text: &str, value: &str) -> Result<u64> {
    let gno = value.trim().parse::<u64>().map_err(|_| {
        TopologyError::ArgumentError(format!(
            "Invalid GTID set '{}': '{}' is not a transaction number",
            text, value
        ))
    })?;
    if gno > MAX_GNO {
        return Err(TopologyError::ArgumentError(format!(
            "Invalid GTID set '{}': transaction number {} exceeds {}",
            text, gno, MAX_GNO
        )));
    }
    Ok(gno)
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (uuid, intervals) in &self.sets {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{}", uuid)?;
            for iv in intervals {
                if iv.start == iv.end {
                    write!(f, ":{}", iv.start)?;
                } else {
                    write!(f, ":{}-{}", iv.start, iv.end)?;
                }
            }
        }
        Ok(())
    }
}

impl From<GtidSet> for String {
    fn from(set: GtidSet) -> String {
        set.to_string()
    }
}

impl TryFrom<String> for GtidSet {
    type Error = TopologyError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";
    const B: &str = "8a94f357-aab4-11df-86ab-c80aa9429562";

    #[test]
    fn test_parse_and_normalize() {
        let set: GtidSet = format!("{A}:1-5:6-9:12, {B}:3").parse().unwrap();
        assert_eq!(set.to_string(), format!("{A}:1-9:12,{B}:3"));
        assert_eq!(set.count(), 11);
        assert_eq!(set.last_gno(A), Some(12));
    }

    #[test]
    fn test_empty_text_is_empty_set() {
        let set = GtidSet::parse("  ").unwrap();
        assert!(set.is_empty());
        assert_eq!(set.to_string(), "");
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(GtidSet::parse("not-a-uuid:1-3").is_err());
        assert!(GtidSet::parse(&format!("{A}:5-3")).is_err());
        assert!(GtidSet::parse(&format!("{A}:0")).is_err());
        assert!(GtidSet::parse(A).is_err());
    }

    #[test]
    fn test_gno_upper_bound() {
        let err = GtidSet::parse(&format!("{A}:1-18446744073709551615")).unwrap_err();
        assert!(matches!(err, TopologyError::ArgumentError(ref m) if m.contains("exceeds")));
        assert!(GtidSet::parse(&format!("{A}:9223372036854775808")).is_err());

        let full = GtidSet::parse(&format!("{A}:1-9223372036854775807")).unwrap();
        assert_eq!(full.count(), MAX_GNO);
        let other = GtidSet::parse(&format!("{B}:1-9223372036854775807")).unwrap();
        assert_eq!(full.union(&other).count(), 2 * MAX_GNO);
        let tail = GtidSet::parse(&format!("{A}:9223372036854775807")).unwrap();
        assert_eq!(full.subtract(&tail).count(), MAX_GNO - 1);
        assert!(tail.subtract(&full).is_empty());

        let mut clamped = GtidSet::new();
        clamped.add_interval(A, MAX_GNO - 1, u64::MAX);
        assert_eq!(clamped.count(), 2);
    }

    #[test]
    fn test_subtract_splits_intervals() {
        let a = GtidSet::parse(&format!("{A}:1-10")).unwrap();
        let b = GtidSet::parse(&format!("{A}:3-4:8")).unwrap();
        assert_eq!(a.subtract(&b).to_string(), format!("{A}:1-2:5-7:9-10"));
        assert!(b.subtract(&a).is_empty());
    }

    #[test]
    fn test_subset_union_intersection() {
        let a = GtidSet::parse(&format!("{A}:1-5")).unwrap();
        let b = GtidSet::parse(&format!("{A}:1-10,{B}:1")).unwrap();
        assert!(a.is_subset_of(&b));
        assert!(!b.is_subset_of(&a));
        assert_eq!(a.union(&b), b);
        assert_eq!(a.intersection(&b), a);
        assert!(b.without_uuid(B).contains(A, 7));
        assert!(!b.without_uuid(B).contains(B, 1));
    }

    #[test]
    fn test_uuid_case_insensitive() {
        let upper = GtidSet::parse(&format!("{}:1-2", A.to_uppercase())).unwrap();
        let lower = GtidSet::parse(&format!("{A}:1-2")).unwrap();
        assert_eq!(upper, lower);
    }

    #[test]
    fn test_serde_as_string() {
        let set = GtidSet::parse(&format!("{A}:1-3")).unwrap();
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, format!("\"{A}:1-3\""));
        let back: GtidSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }
}
