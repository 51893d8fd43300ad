pub mod aggregate;
pub mod allocation;
pub mod self_consumption;
pub mod target;
pub mod types;

pub use aggregate::aggregate;
pub use allocation::{allocate, AllocationWindow};
pub use self_consumption::SelfConsumptionOptimizer;
pub use target::TargetComplianceOptimizer;
pub use types::*;
