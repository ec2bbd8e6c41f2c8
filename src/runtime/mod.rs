//! 服务运行时框架
//!
//! 管理 HTTP 服务和清理任务的生命周期：启动、等待 Ctrl+C、优雅关闭

pub mod config;
pub mod runtime;
pub mod task;

pub use config::RuntimeConfig;
pub use runtime::ServiceRuntime;
pub use task::{SpawnTask, Task, TaskResult};
