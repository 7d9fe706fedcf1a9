//! 恢复方式决策
//!
//! [`decide`] 是纯函数：相同的 (目标 GTID, 源 GTID, 策略) 输入永远得到相同的决策。
//! 需要人工判断时返回 [`RecoveryDecision::Prompt`]，由 [`resolve`] 通过交互端口询问。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::gtid::{GtidComparison, GtidSet};
use crate::interaction::InteractionPort;
use crate::{Result, TopologyError};

/// 调用方指定的恢复策略（`recoveryMethod` 选项）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryPolicy {
    #[default]
    Auto,
    Clone,
    Incremental,
}

impl FromStr for RecoveryPolicy {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(RecoveryPolicy::Auto),
            "clone" => Ok(RecoveryPolicy::Clone),
            "incremental" => Ok(RecoveryPolicy::Incremental),
            other => Err(TopologyError::ArgumentError(format!(
                "Invalid value for recoveryMethod: '{}' (expected auto, clone or incremental)",
                other
            ))),
        }
    }
}

/// 实际执行的恢复方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryMethod {
    /// 从 donor 全量物理复制
    Clone,
    /// 仅回放 binlog 追平
    Incremental,
}

impl fmt::Display for RecoveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryMethod::Clone => f.write_str("clone"),
            RecoveryMethod::Incremental => f.write_str("incremental"),
        }
    }
}

/// 交互提示的候选项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryChoice {
    Clone,
    Incremental,
    Abort,
}

impl RecoveryChoice {
    pub fn label(&self) -> &'static str {
        match self {
            RecoveryChoice::Clone => "Clone",
            RecoveryChoice::Incremental => "Incremental recovery",
            RecoveryChoice::Abort => "Abort",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailKind {
    /// 需要调用方显式给出选项
    Argument,
    /// GTID 状态与恢复方式不兼容
    State,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryDecision {
    Use {
        method: RecoveryMethod,
        reason: String,
    },
    Prompt {
        options: Vec<RecoveryChoice>,
        default: usize,
        reason: String,
    },
    Fail {
        kind: FailKind,
        message: String,
    },
}

/// 决策输入
#[derive(Debug, Clone, Copy)]
pub struct RecoveryInput<'a> {
    pub target: &'a GtidSet,
    pub source_executed: &'a GtidSet,
    pub source_purged: &'a GtidSet,
    pub policy: RecoveryPolicy,
    pub interactive: bool,
    /// 拓扑允许并且版本支持 clone
    pub clone_available: bool,
    /// 源端 GTID 集合被声明为完整（空目标可以安全增量恢复）
    pub source_complete: bool,
}

/// 纯决策函数
pub fn decide(input: &RecoveryInput<'_>) -> RecoveryDecision {
    let cmp = GtidComparison::compute(input.target, input.source_executed, input.source_purged);
    let has_errant = !cmp.errant.is_empty();
    let has_gap = !cmp.unrecoverable.is_empty();

    match input.policy {
        RecoveryPolicy::Incremental => {
            if has_errant {
                return fail(
                    FailKind::State,
                    format!(
                        "The target instance has errant transactions not present in the source ({}); incremental recovery would leave it inconsistent",
                        cmp.errant
                    ),
                );
            }
            if has_gap {
                return fail(
                    FailKind::State,
                    format!(
                        "Transactions required by the target instance were purged from the source ({}); incremental recovery is not possible",
                        cmp.unrecoverable
                    ),
                );
            }
            return use_method(RecoveryMethod::Incremental, "recoveryMethod=incremental requested");
        }
        RecoveryPolicy::Clone => {
            if !input.clone_available {
                return fail(
                    FailKind::Argument,
                    "recoveryMethod=clone requested but clone is disabled or not supported for this topology",
                );
            }
            return use_method(RecoveryMethod::Clone, "recoveryMethod=clone requested");
        }
        RecoveryPolicy::Auto => {}
    }

    if has_errant {
        let reason = format!(
            "The target instance has errant transactions not present in the source: {}",
            cmp.errant
        );
        if !input.clone_available {
            return fail(
                FailKind::State,
                format!("{}; clone is disabled so the instance cannot be recovered", reason),
            );
        }
        if input.interactive {
            return RecoveryDecision::Prompt {
                options: vec![RecoveryChoice::Clone, RecoveryChoice::Abort],
                default: 1,
                reason,
            };
        }
        return fail(
            FailKind::Argument,
            format!("{}; you must set recoveryMethod=clone explicitly to overwrite the instance", reason),
        );
    }

    if has_gap {
        if !input.clone_available {
            return fail(
                FailKind::State,
                format!(
                    "Transactions {} were purged from the source and clone is disabled; the instance cannot be recovered",
                    cmp.unrecoverable
                ),
            );
        }
        return use_method(
            RecoveryMethod::Clone,
            format!("Transactions {} were purged from the source; clone is required", cmp.unrecoverable),
        );
    }

    if cmp.missing.is_empty() {
        return use_method(RecoveryMethod::Incremental, "The target instance is already up to date");
    }

    if input.target.is_empty() {
        if input.source_complete {
            return use_method(
                RecoveryMethod::Incremental,
                "The target has an empty GTID set and the source is assumed complete",
            );
        }
        let reason = "The target instance has an empty GTID set; it is not possible to tell whether it has data that would be overwritten or lost".to_string();
        if input.interactive {
            // clone 不可用时只剩增量恢复与放弃
            let options = if input.clone_available {
                vec![RecoveryChoice::Clone, RecoveryChoice::Incremental, RecoveryChoice::Abort]
            } else {
                vec![RecoveryChoice::Incremental, RecoveryChoice::Abort]
            };
            return RecoveryDecision::Prompt {
                options,
                default: 0,
                reason,
            };
        }
        return fail(
            FailKind::Argument,
            format!("{}; you must set recoveryMethod explicitly", reason),
        );
    }

    use_method(
        RecoveryMethod::Incremental,
        "The target GTID set is a subset of the source; incremental recovery is safe",
    )
}

fn use_method(method: RecoveryMethod, reason: impl Into<String>) -> RecoveryDecision {
    RecoveryDecision::Use {
        method,
        reason: reason.into(),
    }
}

fn fail(kind: FailKind, message: impl Into<String>) -> RecoveryDecision {
    RecoveryDecision::Fail {
        kind,
        message: message.into(),
    }
}

/// 最终选中的恢复方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverySelection {
    pub method: RecoveryMethod,
    pub reason: String,
    /// 是否经过人工选择
    pub prompted: bool,
}

/// 执行决策（必要时询问交互端口）
pub fn resolve(decision: RecoveryDecision, port: &dyn InteractionPort) -> Result<RecoverySelection> {
    match decision {
        RecoveryDecision::Use { method, reason } => Ok(RecoverySelection {
            method,
            reason,
            prompted: false,
        }),
        RecoveryDecision::Fail { kind, message } => Err(match kind {
            FailKind::Argument => TopologyError::ArgumentError(message),
            FailKind::State => TopologyError::RecoveryStateError(message),
        }),
        RecoveryDecision::Prompt {
            options,
            default,
            reason,
        } => {
            let labels: Vec<String> = options.iter().map(|o| o.label().to_string()).collect();
            let question = format!(
                "{}\nPlease select a recovery method:",
                reason
            );
            let index = port.select(&question, &labels, default)?;
            let choice = options.get(index).copied().ok_or_else(|| {
                TopologyError::ArgumentError(format!("Invalid recovery option index {}", index))
            })?;
            let method = match choice {
                RecoveryChoice::Clone => RecoveryMethod::Clone,
                RecoveryChoice::Incremental => RecoveryMethod::Incremental,
                RecoveryChoice::Abort => {
                    return Err(TopologyError::Cancelled("Recovery method selection aborted".to_string()))
                }
            };
            Ok(RecoverySelection {
                method,
                reason,
                prompted: true,
            })
        }
    }
}

pub fn choose_recovery_method(
    input: &RecoveryInput<'_>,
    port: &dyn InteractionPort,
) -> Result<RecoverySelection> {
    let decision = decide(input);
    log::debug!("Recovery decision: {:?}", decision);
    resolve(decision, port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interaction::{NonInteractive, ScriptedAnswer, ScriptedInteraction};

    const S: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";
    const T: &str = "8a94f357-aab4-11df-86ab-c80aa9429562";

    fn set(text: &str) -> GtidSet {
        GtidSet::parse(text).unwrap()
    }

    fn input<'a>(
        target: &'a GtidSet,
        source: &'a GtidSet,
        purged: &'a GtidSet,
        policy: RecoveryPolicy,
        interactive: bool,
    ) -> RecoveryInput<'a> {
        RecoveryInput {
            target,
            source_executed: source,
            source_purged: purged,
            policy,
            interactive,
            clone_available: true,
            source_complete: false,
        }
    }

    fn method_of(d: &RecoveryDecision) -> Option<RecoveryMethod> {
        match d {
            RecoveryDecision::Use { method, .. } => Some(*method),
            _ => None,
        }
    }

    #[test]
    fn test_subset_selects_incremental_without_prompt() {
        let source = set(&format!("{S}:1-100"));
        let target = set(&format!("{S}:1-40"));
        let empty = GtidSet::new();
        let d = decide(&input(&target, &source, &empty, RecoveryPolicy::Auto, true));
        assert_eq!(method_of(&d), Some(RecoveryMethod::Incremental));
    }

    #[test]
    fn test_empty_target_complete_source_is_incremental() {
        let source = set(&format!("{S}:1-100"));
        let target = GtidSet::new();
        let empty = GtidSet::new();
        let mut i = input(&target, &source, &empty, RecoveryPolicy::Auto, false);
        i.source_complete = true;
        assert_eq!(method_of(&decide(&i)), Some(RecoveryMethod::Incremental));
    }

    #[test]
    fn test_empty_target_ambiguous() {
        let source = set(&format!("{S}:1-100"));
        let target = GtidSet::new();
        let empty = GtidSet::new();

        // 交互模式：三选一
        let d = decide(&input(&target, &source, &empty, RecoveryPolicy::Auto, true));
        match d {
            RecoveryDecision::Prompt { options, .. } => assert_eq!(options.len(), 3),
            other => panic!("expected prompt, got {:?}", other),
        }

        // 非交互：必须显式指定
        let d = decide(&input(&target, &source, &empty, RecoveryPolicy::Auto, false));
        match d {
            RecoveryDecision::Fail { message, .. } => assert!(message.contains("must set recoveryMethod")),
            other => panic!("expected failure, got {:?}", other),
        }

        // 显式指定直接使用
        let d = decide(&input(&target, &source, &empty, RecoveryPolicy::Incremental, false));
        assert_eq!(method_of(&d), Some(RecoveryMethod::Incremental));
        let d = decide(&input(&target, &source, &empty, RecoveryPolicy::Clone, false));
        assert_eq!(method_of(&d), Some(RecoveryMethod::Clone));
    }

    #[test]
    fn test_empty_target_ambiguous_without_clone() {
        let source = set(&format!("{S}:1-100"));
        let target = GtidSet::new();
        let empty = GtidSet::new();

        let mut i = input(&target, &source, &empty, RecoveryPolicy::Auto, false);
        i.clone_available = false;
        match decide(&i) {
            RecoveryDecision::Fail { kind, message } => {
                assert_eq!(kind, FailKind::Argument);
                assert!(message.contains("must set recoveryMethod"));
            }
            other => panic!("expected failure, got {:?}", other),
        }

        // 交互模式只剩增量恢复与放弃
        i.interactive = true;
        match decide(&i) {
            RecoveryDecision::Prompt { options, .. } => {
                assert_eq!(options, vec![RecoveryChoice::Incremental, RecoveryChoice::Abort])
            }
            other => panic!("expected prompt, got {:?}", other),
        }
    }

    #[test]
    fn test_errant_transactions() {
        let source = set(&format!("{S}:1-100"));
        let target = set(&format!("{S}:1-100,{T}:1"));
        let empty = GtidSet::new();

        let d = decide(&input(&target, &source, &empty, RecoveryPolicy::Auto, true));
        match &d {
            RecoveryDecision::Prompt { options, .. } => {
                assert_eq!(options, &vec![RecoveryChoice::Clone, RecoveryChoice::Abort])
            }
            other => panic!("expected prompt, got {:?}", other),
        }

        let d = decide(&input(&target, &source, &empty, RecoveryPolicy::Auto, false));
        assert!(matches!(&d, RecoveryDecision::Fail { message, .. } if message.contains("must set recoveryMethod")));

        // 显式 incremental 永远失败，不会回退到 clone
        let d = decide(&input(&target, &source, &empty, RecoveryPolicy::Incremental, true));
        assert!(matches!(d, RecoveryDecision::Fail { kind: FailKind::State, .. }));

        let mut no_clone = input(&target, &source, &empty, RecoveryPolicy::Auto, true);
        no_clone.clone_available = false;
        assert!(matches!(decide(&no_clone), RecoveryDecision::Fail { kind: FailKind::State, .. }));
    }

    #[test]
    fn test_purged_gap() {
        let source = set(&format!("{S}:1-100"));
        let purged = set(&format!("{S}:1-80"));
        let target = set(&format!("{S}:1-50"));

        let d = decide(&input(&target, &source, &purged, RecoveryPolicy::Auto, true));
        assert_eq!(method_of(&d), Some(RecoveryMethod::Clone));

        let d = decide(&input(&target, &source, &purged, RecoveryPolicy::Incremental, true));
        assert!(matches!(d, RecoveryDecision::Fail { kind: FailKind::State, .. }));

        // 目标已经越过 purged 区间：增量即可
        let target = set(&format!("{S}:1-90"));
        let d = decide(&input(&target, &source, &purged, RecoveryPolicy::Auto, true));
        assert_eq!(method_of(&d), Some(RecoveryMethod::Incremental));
    }

    #[test]
    fn test_explicit_clone_when_disabled_fails() {
        let source = set(&format!("{S}:1-10"));
        let target = GtidSet::new();
        let empty = GtidSet::new();
        let mut i = input(&target, &source, &empty, RecoveryPolicy::Clone, false);
        i.clone_available = false;
        assert!(matches!(decide(&i), RecoveryDecision::Fail { kind: FailKind::Argument, .. }));
    }

    #[test]
    fn test_decision_is_deterministic() {
        let source = set(&format!("{S}:1-100"));
        let purged = set(&format!("{S}:1-20"));
        let targets = [
            GtidSet::new(),
            set(&format!("{S}:1-10")),
            set(&format!("{S}:1-60")),
            set(&format!("{S}:1-60,{T}:1-2")),
        ];
        for target in &targets {
            for policy in [RecoveryPolicy::Auto, RecoveryPolicy::Clone, RecoveryPolicy::Incremental] {
                for interactive in [true, false] {
                    let i = input(target, &source, &purged, policy, interactive);
                    let first = decide(&i);
                    // 中间穿插其它输入的决策，结果不受调用顺序影响
                    let _ = decide(&input(&targets[3], &source, &purged, RecoveryPolicy::Auto, true));
                    assert_eq!(first, decide(&i));
                }
            }
        }
    }

    #[test]
    fn test_resolve_prompt_and_abort() {
        let decision = RecoveryDecision::Prompt {
            options: vec![RecoveryChoice::Clone, RecoveryChoice::Abort],
            default: 1,
            reason: "errant".to_string(),
        };

        let port = ScriptedInteraction::new(vec![ScriptedAnswer::Select(0)]);
        let selection = resolve(decision.clone(), &port).unwrap();
        assert_eq!(selection.method, RecoveryMethod::Clone);
        assert!(selection.prompted);

        let port = ScriptedInteraction::new(vec![ScriptedAnswer::Select(1)]);
        assert!(matches!(resolve(decision.clone(), &port), Err(TopologyError::Cancelled(_))));

        assert!(resolve(decision, &NonInteractive).is_err());
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("CLONE".parse::<RecoveryPolicy>().unwrap(), RecoveryPolicy::Clone);
        assert!("copy".parse::<RecoveryPolicy>().is_err());
    }
}
