pub mod entities;
pub mod mutations;
pub mod repositories;

// SQLx 实现（仅在启用 sqlx-support feature 时编译）
#[cfg(feature = "sqlx-support")]
pub mod sqlx_impls;

pub use entities::*;
pub use gnomehat_errors::{SchedulerError, SchedulerResult};
pub use mutations::*;
pub use repositories::*;
