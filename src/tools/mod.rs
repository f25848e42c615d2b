//! 能力层：注册表、带超时与审计的执行器、内置演示能力

pub mod clock;
pub mod echo;
pub mod executor;
pub mod registry;
pub mod schema;
pub mod text_stats;

pub use clock::ClockTool;
pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use registry::{Capability, CapabilityDescriptor, RiskClass, ToolRegistry, Volatility};
pub use schema::plan_format_schema_json;
pub use text_stats::TextStatsTool;

/// 注册内置演示能力（echo / clock / text_stats）
pub fn register_builtin(registry: &mut ToolRegistry) {
    registry.register(EchoTool);
    registry.register(ClockTool);
    registry.register(TextStatsTool);
}
