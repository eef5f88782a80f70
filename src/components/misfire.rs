//! Misfire 扫描器
//! Misfire scanner
//!
//! 周期性检查并修正 misfire 的触发器（计划触发时刻已越过阈值但尚
//! 未被调度线程分发的触发器）。批次限定每轮工作量；批满则立即再跑
//! 一轮。
//! Periodically checks for and corrects misfired triggers (triggers
//! whose scheduled instant slipped past the threshold before the
//! scheduler thread could dispatch them). Batches cap the work per
//! pass; a full batch triggers an immediate extra pass.

use crate::components::ComponentLifecycle;
use crate::error::Result;
use crate::listener::ListenerManager;
use crate::store::JobStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Misfire 扫描器配置
/// Misfire scanner configuration
#[derive(Debug, Clone)]
pub struct MisfireHandlerConfig {
  /// 扫描间隔
  /// Scan interval
  pub interval: Duration,
  /// 每轮最多处理的触发器数
  /// Maximum triggers handled per pass
  pub max_misfires_to_handle_at_a_time: usize,
  /// 瞬态存储错误的最大重试次数
  /// Maximum retries for transient store errors
  pub max_retries: u32,
}

impl Default for MisfireHandlerConfig {
  fn default() -> Self {
    Self {
      interval: Duration::from_secs(60),
      max_misfires_to_handle_at_a_time: 20,
      max_retries: 5,
    }
  }
}

/// Misfire 扫描器
/// Misfire scanner
pub struct MisfireHandler {
  store: Arc<dyn JobStore>,
  config: MisfireHandlerConfig,
  listeners: Arc<ListenerManager>,
  /// 处理到新触发时刻时唤醒调度循环
  /// Wakes the scheduling loop when handling yields new fire instants
  signal: Arc<Notify>,
  done: AtomicBool,
}

impl MisfireHandler {
  /// 创建扫描器
  /// Create the scanner
  pub fn new(
    store: Arc<dyn JobStore>,
    config: MisfireHandlerConfig,
    listeners: Arc<ListenerManager>,
    signal: Arc<Notify>,
  ) -> Self {
    Self {
      store,
      config,
      listeners,
      signal,
      done: AtomicBool::new(false),
    }
  }

  /// 跑一轮（含批满后的立即续轮）
  /// Run one pass (including immediate follow-ups after full batches)
  async fn scan(&self) -> Result<()> {
    loop {
      let outcome = retry_transient(self.config.max_retries, || {
        let store = self.store.clone();
        let max = self.config.max_misfires_to_handle_at_a_time;
        async move { store.handle_misfires(max).await }
      })
      .await?;

      if outcome.handled > 0 {
        tracing::info!(
          handled = outcome.handled,
          has_more = outcome.has_more,
          "misfired triggers handled"
        );
        for key in &outcome.handled_triggers {
          self.listeners.notify_trigger_misfired(key).await;
        }
        self.signal.notify_one();
      }
      if !outcome.has_more {
        return Ok(());
      }
    }
  }
}

impl ComponentLifecycle for MisfireHandler {
  fn start(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.config.interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
      loop {
        ticker.tick().await;
        if self.done.load(Ordering::Relaxed) {
          tracing::debug!("misfire handler: shutting down");
          break;
        }
        if let Err(err) = self.scan().await {
          tracing::error!(error = %err, "misfire scan failed");
        }
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

/// 以有界退避重试瞬态错误
/// Retry transient errors with bounded backoff
///
/// 存储层的死锁 / 序列化失败 / 锁超时在此吸收；其余错误或重试
/// 次数耗尽后原样上抛。
/// Store-layer deadlocks / serialization failures / lock timeouts are
/// absorbed here; other errors, or retry exhaustion, surface unchanged.
pub(crate) async fn retry_transient<T, F, Fut>(max_retries: u32, mut operation: F) -> Result<T>
where
  F: FnMut() -> Fut,
  Fut: std::future::Future<Output = Result<T>>,
{
  let mut attempt = 0u32;
  loop {
    match operation().await {
      Ok(value) => return Ok(value),
      Err(err) if err.is_retriable() && attempt < max_retries => {
        attempt += 1;
        let backoff = Duration::from_millis(100u64 << attempt.min(6));
        tracing::warn!(attempt, error = %err, "retrying transient job store failure");
        tokio::time::sleep(backoff).await;
      }
      Err(err) => return Err(err),
    }
  }
}
