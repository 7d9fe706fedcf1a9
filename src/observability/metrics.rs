//! Prometheus 指标导出模块
//!
//! 提供编排引擎的监控指标：
//! - 拓扑操作次数与耗时
//! - 故障转移次数
//! - 元数据提交与冲突
//! - ClusterSet 全局视图号

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};

lazy_static! {
    /// 全局 Prometheus Registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ═══════════════════════════════════════════════════════════════════
    // 拓扑操作指标
    // ═══════════════════════════════════════════════════════════════════

    /// 拓扑操作总数（按操作名与结果）
    pub static ref OPERATION_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("operation_total", "Total number of topology operations")
            .namespace("qatopology"),
        &["operation", "outcome"]
    ).expect("Failed to create OPERATION_TOTAL metric");

    /// 拓扑操作耗时 (毫秒)
    pub static ref OPERATION_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new("operation_latency_ms", "Topology operation latency in milliseconds")
            .namespace("qatopology")
            .buckets(vec![1.0, 5.0, 25.0, 100.0, 500.0, 1000.0, 5000.0, 30000.0, 120000.0]),
        &["operation"]
    ).expect("Failed to create OPERATION_LATENCY metric");

    /// 故障转移次数（force primary / force quorum / force primary cluster）
    pub static ref FAILOVER_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("failover_total", "Total number of forced failovers")
            .namespace("qatopology"),
        &["kind"]
    ).expect("Failed to create FAILOVER_TOTAL metric");

    // ═══════════════════════════════════════════════════════════════════
    // 元数据指标
    // ═══════════════════════════════════════════════════════════════════

    /// 元数据提交（ok / conflict）
    pub static ref METADATA_COMMIT_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("metadata_commit_total", "Metadata transaction commits by outcome")
            .namespace("qatopology"),
        &["outcome"]
    ).expect("Failed to create METADATA_COMMIT_TOTAL metric");

    /// ClusterSet 全局视图号
    pub static ref CLUSTERSET_VIEW_ID: IntGaugeVec = IntGaugeVec::new(
        Opts::new("clusterset_view_id", "Current global view id of each ClusterSet")
            .namespace("qatopology"),
        &["clusterset"]
    ).expect("Failed to create CLUSTERSET_VIEW_ID metric");
}

/// 初始化所有指标
pub fn init_metrics() {
    REGISTRY.register(Box::new(OPERATION_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(OPERATION_LATENCY.clone())).ok();
    REGISTRY.register(Box::new(FAILOVER_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(METADATA_COMMIT_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(CLUSTERSET_VIEW_ID.clone())).ok();

    log::info!("Prometheus metrics initialized");
}

/// 导出指标（Prometheus 文本格式）
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        log::warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// 操作计时器，observe 时同时记录次数与耗时
pub struct OperationTimer {
    start: std::time::Instant,
    operation: String,
}

impl OperationTimer {
    pub fn start(operation: &str) -> Self {
        Self {
            start: std::time::Instant::now(),
            operation: operation.to_string(),
        }
    }

    pub fn observe(self, outcome: &str) {
        let elapsed = self.start.elapsed().as_secs_f64() * 1000.0;
        OPERATION_LATENCY
            .with_label_values(&[self.operation.as_str()])
            .observe(elapsed);
        OPERATION_TOTAL
            .with_label_values(&[self.operation.as_str(), outcome])
            .inc();
    }
}

// ═══════════════════════════════════════════════════════════════════════
// 便捷宏
// ═══════════════════════════════════════════════════════════════════════

/// 记录故障转移
#[macro_export]
macro_rules! record_failover {
    ($kind:expr) => {
        $crate::observability::FAILOVER_TOTAL
            .with_label_values(&[$kind])
            .inc();
    };
}

/// 记录元数据提交结果
#[macro_export]
macro_rules! record_metadata_commit {
    ($outcome:expr) => {
        $crate::observability::METADATA_COMMIT_TOTAL
            .with_label_values(&[$outcome])
            .inc();
    };
}

/// 更新 ClusterSet 视图号
#[macro_export]
macro_rules! record_clusterset_view {
    ($domain:expr, $view_id:expr) => {
        $crate::observability::CLUSTERSET_VIEW_ID
            .with_label_values(&[$domain])
            .set($view_id as i64);
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_init() {
        init_metrics();

        OperationTimer::start("addInstance").observe("ok");
        FAILOVER_TOTAL.with_label_values(&["force_primary"]).inc();
        METADATA_COMMIT_TOTAL.with_label_values(&["conflict"]).inc();
        CLUSTERSET_VIEW_ID.with_label_values(&["dom"]).set(7);

        let output = export_metrics();
        assert!(output.contains("qatopology_operation_total"));
        assert!(output.contains("qatopology_failover_total"));
        assert!(output.contains("qatopology_clusterset_view_id"));
    }
}
