//! 集群管理器
//! Cluster manager
//!
//! 周期性写入本实例的检查点，并扫描停止心跳的实例：认领它们残留
//! 的触发记录，把触发器复位回等待态，为请求恢复的作业调度一次性
//! 恢复触发器。
//! Periodically writes this instance's check-in and scans for instances
//! that stopped heartbeating: claims their leftover firing records,
//! restores triggers to the waiting state, and schedules one-shot
//! recovery triggers for recovery-requesting jobs.

use crate::components::misfire::retry_transient;
use crate::components::ComponentLifecycle;
use crate::store::JobStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// 集群管理器配置
/// Cluster manager configuration
#[derive(Debug, Clone)]
pub struct ClusterManagerConfig {
  /// 检查间隔
  /// Check-in interval
  pub checkin_interval: Duration,
  /// 瞬态存储错误的最大重试次数
  /// Maximum retries for transient store errors
  pub max_retries: u32,
}

impl Default for ClusterManagerConfig {
  fn default() -> Self {
    Self {
      checkin_interval: Duration::from_millis(7_500),
      max_retries: 5,
    }
  }
}

/// 集群管理器
/// Cluster manager
pub struct ClusterManager {
  store: Arc<dyn JobStore>,
  config: ClusterManagerConfig,
  /// 接管产生新触发器时唤醒调度循环
  /// Wakes the scheduling loop when a takeover yields new triggers
  signal: Arc<Notify>,
  done: AtomicBool,
}

impl ClusterManager {
  /// 创建管理器
  /// Create the manager
  pub fn new(store: Arc<dyn JobStore>, config: ClusterManagerConfig, signal: Arc<Notify>) -> Self {
    Self {
      store,
      config,
      signal,
      done: AtomicBool::new(false),
    }
  }

  async fn checkin(&self) {
    let result = retry_transient(self.config.max_retries, || {
      let store = self.store.clone();
      async move { store.cluster_checkin().await }
    })
    .await;

    match result {
      Ok(outcome) => {
        if !outcome.failed_instances.is_empty() {
          tracing::warn!(
            failed = ?outcome.failed_instances,
            restored = outcome.recovered_triggers,
            recovery_triggers = outcome.recovery_triggers_scheduled,
            "took over work from failed instances"
          );
          self.signal.notify_one();
        }
      }
      Err(err) => {
        tracing::error!(error = %err, "cluster check-in failed");
      }
    }
  }
}

impl ComponentLifecycle for ClusterManager {
  fn start(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      // 启动即先做一次检查，尽快接管崩溃实例的工作
      // Check in immediately on start so crashed instances' work is
      // taken over promptly
      self.checkin().await;
      let mut ticker = tokio::time::interval(self.config.checkin_interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        if self.done.load(Ordering::Relaxed) {
          tracing::debug!("cluster manager: shutting down");
          break;
        }
        self.checkin().await;
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
