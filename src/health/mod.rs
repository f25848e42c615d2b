//! 节点健康：周期探测远端节点，维护 online / degraded / offline 状态

pub mod monitor;
pub mod probe;

pub use monitor::{apply_probe_result, HealthMonitor, NodeHealth, NodeStatus};
pub use probe::{HttpProbe, NodeProbe, StaticProbe};
