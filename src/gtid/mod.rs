//! GTID 集合运算与对账

pub mod reconcile;
pub mod set;

pub use reconcile::{backlog, errant, is_purged_gap, purged_gap, wait_for_sync, GtidComparison};
pub use set::{GtidInterval, GtidSet, MAX_GNO};
