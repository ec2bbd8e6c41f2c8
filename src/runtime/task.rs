//! 任务定义模块
//!
//! 运行时管理的后台任务（HTTP 服务、清理任务等）统一抽象为 `Task`

use std::future::Future;
use std::pin::Pin;

/// 任务执行结果
pub type TaskResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// 任务 trait
pub trait Task: Send {
    /// 获取任务名称
    fn name(&self) -> &str;

    /// 运行任务
    ///
    /// # 参数
    /// * `shutdown_rx` - 关闭信号接收器，当收到信号时任务应该优雅关闭
    fn run(
        self: Box<Self>,
        shutdown_rx: tokio::sync::oneshot::Receiver<()>,
    ) -> Pin<Box<dyn Future<Output = TaskResult> + Send>>;
}

type FutureFn = Box<
    dyn FnOnce(tokio::sync::oneshot::Receiver<()>) -> Pin<Box<dyn Future<Output = TaskResult> + Send>>
        + Send
        + 'static,
>;

/// Spawn 任务
///
/// 用闭包延迟构建 Future，以便在 run 时传入 shutdown_rx
pub struct SpawnTask {
    name: String,
    future_fn: FutureFn,
}

impl SpawnTask {
    /// 创建不关心关闭信号的任务
    pub fn new<Fut>(name: impl Into<String>, future: Fut) -> Self
    where
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            future_fn: Box::new(move |_shutdown_rx| Box::pin(future)),
        }
    }

    /// 创建需要关闭信号的任务
    ///
    /// # 示例
    /// ```rust,no_run
    /// use gameops_discovery::runtime::SpawnTask;
    ///
    /// let task = SpawnTask::with_shutdown("my-task", |shutdown_rx| async move {
    ///     let _ = shutdown_rx.await;
    ///     Ok(())
    /// });
    /// ```
    pub fn with_shutdown<F, Fut>(name: impl Into<String>, future_fn: F) -> Self
    where
        F: FnOnce(tokio::sync::oneshot::Receiver<()>) -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            future_fn: Box::new(move |shutdown_rx| Box::pin(future_fn(shutdown_rx))),
        }
    }
}

impl Task for SpawnTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(
        self: Box<Self>,
        shutdown_rx: tokio::sync::oneshot::Receiver<()>,
    ) -> Pin<Box<dyn Future<Output = TaskResult> + Send>> {
        (self.future_fn)(shutdown_rx)
    }
}
