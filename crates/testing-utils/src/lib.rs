//! # gnomehat 测试工具
//!
//! 各 crate 共享的测试替身和数据构造器：
//!
//! - **JobBuilder**: 直接构造任意状态的 `Job`
//! - **FlakyJobStore**: 前 N 次调用返回可重试错误的存储包装
//! - **ScriptedRunner**: 退出时机和退出码由测试脚本决定的执行器
//! - **TestEnv**: 内存调度器装配、条件等待
//!
//! ```toml
//! [dev-dependencies]
//! gnomehat-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
