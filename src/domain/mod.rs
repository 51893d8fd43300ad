pub mod flexibility;
pub mod schedule;
pub mod storage;
pub mod task;
pub mod types;

pub use flexibility::*;
pub use schedule::*;
pub use storage::*;
pub use task::*;
pub use types::*;
