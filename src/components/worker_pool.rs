//! 工作者池模块
//! Worker pool module
//!
//! 有界工作者池：信号量限制并发数，`block_for_available_threads`
//! 阻塞到至少有一个空闲工作者。支持优雅关闭（等待在途作业）与
//! 中止关闭。
//! Bounded worker pool: a semaphore caps concurrency and
//! `block_for_available_threads` blocks until at least one worker is
//! idle. Supports graceful shutdown (waiting for in-flight jobs) and
//! aborted shutdown.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// 有界工作者池
/// Bounded worker pool
pub struct WorkerPool {
  size: usize,
  semaphore: Arc<Semaphore>,
  active_workers: Arc<AtomicUsize>,
}

impl WorkerPool {
  /// 创建 `size` 个工作者的池
  /// Create a pool of `size` workers
  pub fn new(size: usize) -> Self {
    let size = size.max(1);
    Self {
      size,
      semaphore: Arc::new(Semaphore::new(size)),
      active_workers: Arc::new(AtomicUsize::new(0)),
    }
  }

  /// 池大小
  /// Pool size
  pub fn pool_size(&self) -> usize {
    self.size
  }

  /// 当前活跃工作者数
  /// Current number of active workers
  pub fn active_workers(&self) -> usize {
    self.active_workers.load(Ordering::Relaxed)
  }

  /// 阻塞直到至少有一个空闲工作者，返回空闲数
  /// Block until at least one worker is idle, returning the idle count
  ///
  /// 关闭后返回 0。
  /// Returns 0 after shutdown.
  pub async fn block_for_available_threads(&self) -> usize {
    match self.semaphore.acquire().await {
      Ok(permit) => {
        let available = self.semaphore.available_permits() + 1;
        drop(permit);
        available
      }
      // 信号量已关闭
      // The semaphore was closed
      Err(_) => 0,
    }
  }

  /// 把任务交给一个空闲工作者
  /// Hand a task to an idle worker
  ///
  /// 没有空闲工作者时阻塞；仅在关闭后返回 false。
  /// Blocks while no worker is idle; returns false only after shutdown.
  pub async fn run_in_thread<F>(&self, task: F) -> bool
  where
    F: Future<Output = ()> + Send + 'static,
  {
    let permit = match self.semaphore.clone().acquire_owned().await {
      Ok(permit) => permit,
      Err(_) => return false,
    };
    let active_workers = self.active_workers.clone();
    active_workers.fetch_add(1, Ordering::Relaxed);
    tokio::spawn(async move {
      task.await;
      active_workers.fetch_sub(1, Ordering::Relaxed);
      drop(permit);
    });
    true
  }

  /// 关闭池
  /// Shut the pool down
  ///
  /// `wait_for_jobs_to_complete` 置位时先等全部在途作业结束再拒绝
  /// 新任务；否则立即拒绝，新任务失败而在途作业自行跑完。
  /// With `wait_for_jobs_to_complete` set, all in-flight jobs finish
  /// before new tasks are refused; otherwise refusal is immediate and
  /// in-flight jobs run to completion on their own.
  pub async fn shutdown(&self, wait_for_jobs_to_complete: bool) {
    if wait_for_jobs_to_complete {
      // 拿齐全部许可即所有工作者空闲
      // Holding every permit means every worker is idle
      if let Ok(all) = self.semaphore.acquire_many(self.size as u32).await {
        all.forget();
      }
    }
    self.semaphore.close();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;
  use tokio::sync::Mutex;

  #[tokio::test]
  async fn test_block_for_available_threads_reports_idle_count() {
    let pool = WorkerPool::new(3);
    assert_eq!(pool.block_for_available_threads().await, 3);
  }

  #[tokio::test]
  async fn test_pool_bounds_concurrency() {
    let pool = Arc::new(WorkerPool::new(2));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    for _ in 0..6 {
      let running = running.clone();
      let peak = peak.clone();
      let submitted = pool
        .run_in_thread(async move {
          let current = running.fetch_add(1, Ordering::SeqCst) + 1;
          peak.fetch_max(current, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_millis(30)).await;
          running.fetch_sub(1, Ordering::SeqCst);
        })
        .await;
      assert!(submitted);
    }

    pool.shutdown(true).await;
    assert!(peak.load(Ordering::SeqCst) <= 2);
  }

  #[tokio::test]
  async fn test_run_in_thread_refused_after_shutdown() {
    let pool = WorkerPool::new(1);
    pool.shutdown(false).await;
    assert!(!pool.run_in_thread(async {}).await);
    assert_eq!(pool.block_for_available_threads().await, 0);
  }

  #[tokio::test]
  async fn test_graceful_shutdown_waits_for_jobs() {
    let pool = Arc::new(WorkerPool::new(1));
    let log = Arc::new(Mutex::new(Vec::new()));

    let log_clone = log.clone();
    pool
      .run_in_thread(async move {
        tokio::time::sleep(Duration::from_millis(40)).await;
        log_clone.lock().await.push("job done");
      })
      .await;

    pool.shutdown(true).await;
    log.lock().await.push("shutdown returned");

    let entries = log.lock().await;
    assert_eq!(*entries, vec!["job done", "shutdown returned"]);
  }
}
