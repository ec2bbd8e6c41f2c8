//! 服务运行时实现
//!
//! 启动所有任务，等待关闭信号（Ctrl+C 或任意任务提前退出），
//! 然后通知所有任务关闭并在超时时间内等待它们结束

use std::future::Future;

use anyhow::Result;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::runtime::config::RuntimeConfig;
use crate::runtime::task::{SpawnTask, Task, TaskResult};

/// 服务运行时
///
/// # 使用示例
/// ```rust,no_run
/// use gameops_discovery::runtime::ServiceRuntime;
///
/// # async fn demo() -> anyhow::Result<()> {
/// ServiceRuntime::new("discovery-admin")
///     .add_spawn_with_shutdown("worker", |shutdown_rx| async move {
///         let _ = shutdown_rx.await;
///         Ok(())
///     })
///     .run()
///     .await
/// # }
/// ```
pub struct ServiceRuntime {
    service_name: String,
    tasks: Vec<Box<dyn Task>>,
    config: RuntimeConfig,
}

impl ServiceRuntime {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            tasks: Vec::new(),
            config: RuntimeConfig::default(),
        }
    }

    /// 设置运行时配置
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// 添加任务
    pub fn add_task(mut self, task: Box<dyn Task>) -> Self {
        info!(task_name = %task.name(), "Adding task to runtime");
        self.tasks.push(task);
        self
    }

    /// 添加需要关闭信号的 spawn 任务
    pub fn add_spawn_with_shutdown<F, Fut>(self, name: impl Into<String>, future_fn: F) -> Self
    where
        F: FnOnce(oneshot::Receiver<()>) -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        self.add_task(Box::new(SpawnTask::with_shutdown(name, future_fn)))
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// 运行直到收到 Ctrl+C
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received (Ctrl+C)");
        })
        .await
    }

    /// 运行直到 `signal` 完成或任意任务提前退出
    pub async fn run_until<S>(mut self, signal: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        info!(
            service_name = %self.service_name,
            task_count = self.tasks.len(),
            "Starting service runtime"
        );

        let tasks = std::mem::take(&mut self.tasks);
        let (mut join_set, task_shutdowns) = Self::start_tasks(tasks);

        let mut early_exit = false;
        tokio::select! {
            _ = signal => {}
            Some(result) = join_set.join_next(), if !join_set.is_empty() => {
                early_exit = true;
                match result {
                    Ok(Ok(())) => warn!("Task exited before shutdown was requested"),
                    Ok(Err(e)) => error!(error = %e, "Task failed, shutting down runtime"),
                    Err(e) => error!(error = %e, "Task panicked, shutting down runtime"),
                }
            }
        }

        for tx in task_shutdowns {
            let _ = tx.send(());
        }

        Self::wait_for_tasks_shutdown(&self.config, &mut join_set).await;

        info!(service_name = %self.service_name, early_exit = early_exit, "Service runtime stopped");
        Ok(())
    }

    fn start_tasks(tasks: Vec<Box<dyn Task>>) -> (JoinSet<TaskResult>, Vec<oneshot::Sender<()>>) {
        let mut join_set = JoinSet::new();
        let mut task_shutdowns = Vec::with_capacity(tasks.len());

        for task in tasks {
            let task_name = task.name().to_string();
            let (task_shutdown_tx, task_shutdown_rx) = oneshot::channel();
            task_shutdowns.push(task_shutdown_tx);

            let task_future = task.run(task_shutdown_rx);

            join_set.spawn(async move {
                let result = task_future.await;
                match &result {
                    Ok(_) => info!(task_name = %task_name, "Task completed"),
                    Err(e) => error!(task_name = %task_name, error = %e, "Task failed"),
                }
                result
            });
        }

        (join_set, task_shutdowns)
    }

    async fn wait_for_tasks_shutdown(config: &RuntimeConfig, join_set: &mut JoinSet<TaskResult>) {
        let drained = tokio::time::timeout(config.shutdown_timeout, async {
            while let Some(result) = join_set.join_next().await {
                match result {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(error = %e, "Task completed with error"),
                    Err(e) => warn!(error = %e, "Task join error"),
                }
            }
        })
        .await;

        match drained {
            Ok(_) => info!("All tasks completed"),
            Err(_) => {
                warn!(timeout = ?config.shutdown_timeout, "Tasks shutdown timeout, aborting");
                join_set.abort_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn tasks_receive_shutdown_signal() {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();

        let runtime = ServiceRuntime::new("test").add_spawn_with_shutdown("waiter", move |rx| async move {
            let _ = rx.await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(runtime.task_count(), 1);

        runtime
            .run_until(tokio::time::sleep(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failing_task_stops_runtime() {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();

        ServiceRuntime::new("test")
            .add_spawn_with_shutdown("broken", |_rx| async {
                let result: TaskResult = Err("bind failed".into());
                result
            })
            .add_spawn_with_shutdown("waiter", move |rx| async move {
                let _ = rx.await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .run_until(std::future::pending::<()>())
            .await
            .unwrap();

        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stuck_tasks_are_aborted_after_timeout() {
        let started = tokio::time::Instant::now();
        ServiceRuntime::new("test")
            .with_config(RuntimeConfig::new().with_shutdown_timeout(Duration::from_millis(50)))
            .add_spawn_with_shutdown("stuck", |_rx| async {
                std::future::pending::<()>().await;
                Ok(())
            })
            .run_until(async {})
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
