//! 命名行锁
//! Named row locks
//!
//! 所有变更操作都通过命名行锁串行化。支持 `SELECT … FOR UPDATE` 的
//! 方言用行级排他读取得锁；不支持的方言用一条单行 `UPDATE`，更新
//! 成功即意味着持有。锁行按需创建。写事务在锁持有之后开启，提交
//! 即释放。
//! All mutating operations serialize through named row locks. Dialects
//! with `SELECT … FOR UPDATE` take the lock via an exclusive row read;
//! dialects without it use a single-row `UPDATE` whose success implies
//! ownership. The lock row is created on demand. The write transaction
//! opens after the lock is held; commit releases it.

use crate::backend::dbstore::entity::{locks, Locks};
use crate::backend::dbstore::DatabaseJobStore;
use crate::error::{Result, SchedulerError};
use futures::future::BoxFuture;
use sea_orm::sea_query::Expr;
use sea_orm::{
  ActiveModelTrait, ColumnTrait, DatabaseTransaction, EntityTrait, QueryFilter, QuerySelect, Set,
  TransactionTrait,
};

/// 守护触发器/作业/触发记录变更的锁
/// Lock guarding trigger/job/fired-trigger mutation
pub const LOCK_TRIGGER_ACCESS: &str = "TRIGGER_ACCESS";

/// 守护集群状态与恢复的锁
/// Lock guarding cluster state and recovery
pub const LOCK_STATE_ACCESS: &str = "STATE_ACCESS";

/// 锁获取策略
/// Lock acquisition strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockStrategy {
  /// `SELECT … FOR UPDATE`
  SelectForUpdate,
  /// 单行 `UPDATE`，成功即持有
  /// Single-row `UPDATE`, success implies ownership
  UpdateRow,
}

impl DatabaseJobStore {
  /// 在事务中取得命名锁
  /// Obtain the named lock inside the transaction
  async fn obtain_lock(&self, txn: &DatabaseTransaction, lock_name: &str) -> Result<()> {
    match self.lock_strategy {
      LockStrategy::SelectForUpdate => {
        let found = Locks::find_by_id((self.sched_name.clone(), lock_name.to_string()))
          .lock_exclusive()
          .one(txn)
          .await?;
        if found.is_none() {
          // 锁行按需创建；并发插入者中只有一个成功，失败者在重新
          // 选择时阻塞到锁释放
          // The lock row is created on demand; only one concurrent
          // inserter succeeds, the loser blocks on the re-select until
          // the lock is released
          let row = locks::ActiveModel {
            sched_name: Set(self.sched_name.clone()),
            lock_name: Set(lock_name.to_string()),
          };
          let _ = row.insert(txn).await;
          Locks::find_by_id((self.sched_name.clone(), lock_name.to_string()))
            .lock_exclusive()
            .one(txn)
            .await?
            .ok_or_else(|| SchedulerError::LockTimeout {
              lock_name: lock_name.to_string(),
              timeout_millis: 0,
            })?;
        }
        Ok(())
      }
      LockStrategy::UpdateRow => {
        let updated = Locks::update_many()
          .col_expr(locks::Column::LockName, Expr::value(lock_name))
          .filter(locks::Column::SchedName.eq(self.sched_name.clone()))
          .filter(locks::Column::LockName.eq(lock_name))
          .exec(txn)
          .await?;
        if updated.rows_affected == 0 {
          let row = locks::ActiveModel {
            sched_name: Set(self.sched_name.clone()),
            lock_name: Set(lock_name.to_string()),
          };
          let _ = row.insert(txn).await;
          Locks::update_many()
            .col_expr(locks::Column::LockName, Expr::value(lock_name))
            .filter(locks::Column::SchedName.eq(self.sched_name.clone()))
            .filter(locks::Column::LockName.eq(lock_name))
            .exec(txn)
            .await?;
        }
        Ok(())
      }
    }
  }

  /// 在命名锁内执行闭包
  /// Execute a closure under the named lock
  ///
  /// 事务在锁持有之后才承载写操作；提交释放锁，出错回滚。
  /// The transaction carries writes only after the lock is held; commit
  /// releases the lock, errors roll back.
  pub(crate) async fn execute_in_lock<T, F>(&self, lock_name: &str, operation: F) -> Result<T>
  where
    T: Send,
    F: for<'c> FnOnce(&'c Self, &'c DatabaseTransaction) -> BoxFuture<'c, Result<T>> + Send,
  {
    let txn = self.db.begin().await?;
    self.obtain_lock(&txn, lock_name).await?;
    match operation(self, &txn).await {
      Ok(value) => {
        txn.commit().await?;
        Ok(value)
      }
      Err(err) => {
        let _ = txn.rollback().await;
        Err(err)
      }
    }
  }

}
