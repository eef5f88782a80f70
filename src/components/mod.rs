//! 组件模块
//! Components module
//!
//! 提供通用的组件生命周期管理 trait 与调度器的后台组件：有界工作者
//! 池、misfire 扫描器与集群管理器。
//! Provides the common component lifecycle trait and the scheduler's
//! background components: the bounded worker pool, the misfire scanner,
//! and the cluster manager.

use std::sync::Arc;
use tokio::task::JoinHandle;

pub mod cluster;
pub mod misfire;
pub mod worker_pool;

pub use cluster::{ClusterManager, ClusterManagerConfig};
pub use misfire::{MisfireHandler, MisfireHandlerConfig};
pub use worker_pool::WorkerPool;

/// 组件生命周期接口
/// Component lifecycle interface
///
/// 统一管理后台组件的启动、关闭与状态检查。
/// Unified start/shutdown/state-check management for background
/// components.
///
/// # 实现者 / Implementors
///
/// - [`MisfireHandler`](misfire::MisfireHandler) - 周期性修正 misfire 的触发器
/// - [`ClusterManager`](cluster::ClusterManager) - 集群心跳与失效接管
pub trait ComponentLifecycle {
  /// 启动组件的后台任务
  /// Start the component's background task
  fn start(self: Arc<Self>) -> JoinHandle<()>;

  /// 请求组件停止
  /// Request the component to stop
  fn shutdown(&self);

  /// 组件是否已停止
  /// Whether the component has stopped
  fn is_done(&self) -> bool;
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicBool, Ordering};

  struct TestComponent {
    done: Arc<AtomicBool>,
  }

  impl ComponentLifecycle for TestComponent {
    fn start(self: Arc<Self>) -> JoinHandle<()> {
      tokio::spawn(async move {
        loop {
          if self.done.load(Ordering::Relaxed) {
            break;
          }
          tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
      })
    }

    fn shutdown(&self) {
      self.done.store(true, Ordering::Relaxed);
    }

    fn is_done(&self) -> bool {
      self.done.load(Ordering::Relaxed)
    }
  }

  #[tokio::test]
  async fn test_lifecycle_trait() {
    let component = Arc::new(TestComponent {
      done: Arc::new(AtomicBool::new(false)),
    });

    assert!(!component.is_done());
    let handle = component.clone().start();

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    component.shutdown();

    assert!(component.is_done());
    handle.await.unwrap();
  }
}
