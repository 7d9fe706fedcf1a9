//! 可观测性模块
//!
//! 提供 Prometheus 指标导出与操作计时

pub mod metrics;

pub use metrics::*;
