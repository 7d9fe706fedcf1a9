//! 恢复方式引擎（clone / incremental / 中止）

pub mod method;

pub use method::{
    choose_recovery_method, decide, resolve, FailKind, RecoveryChoice, RecoveryDecision,
    RecoveryInput, RecoveryMethod, RecoveryPolicy, RecoverySelection,
};
