//! 作业与触发器标识模块
//! Job and trigger identity module
//!
//! 作业和触发器都以 `(group, name)` 二元组为身份；触发器通过 `JobKey`
//! 引用作业，绝不持有活对象指针。
//! Jobs and triggers are identified by a `(group, name)` pair; triggers
//! reference jobs through a `JobKey`, never a live pointer.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 默认分组名
/// Default group name
pub const DEFAULT_GROUP: &str = "DEFAULT";

macro_rules! key_type {
  ($name:ident, $doc_zh:literal, $doc_en:literal) => {
    #[doc = $doc_zh]
    #[doc = $doc_en]
    #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    pub struct $name {
      /// 分组
      /// Group
      pub group: String,
      /// 名称
      /// Name
      pub name: String,
    }

    impl $name {
      /// 在指定分组下创建键
      /// Create a key under the given group
      pub fn new<N: Into<String>, G: Into<String>>(name: N, group: G) -> Self {
        Self {
          group: group.into(),
          name: name.into(),
        }
      }

      /// 在默认分组下创建键
      /// Create a key under the default group
      pub fn with_default_group<N: Into<String>>(name: N) -> Self {
        Self::new(name, DEFAULT_GROUP)
      }

      /// 生成带随机名称的唯一键
      /// Generate a unique key with a random name
      pub fn unique<G: Into<String>>(group: G) -> Self {
        Self::new(Uuid::new_v4().to_string(), group)
      }
    }

    impl fmt::Display for $name {
      fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
      }
    }
  };
}

key_type!(
  JobKey,
  "作业键",
  "Job key — identity of a stored `JobDetail`"
);
key_type!(
  TriggerKey,
  "触发器键",
  "Trigger key — identity of a stored trigger"
);

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_display_is_group_dot_name() {
    let key = JobKey::new("reconcile", "billing");
    assert_eq!(key.to_string(), "billing.reconcile");

    let key = TriggerKey::with_default_group("nightly");
    assert_eq!(key.to_string(), "DEFAULT.nightly");
  }

  #[test]
  fn test_unique_keys_differ() {
    let a = TriggerKey::unique(DEFAULT_GROUP);
    let b = TriggerKey::unique(DEFAULT_GROUP);
    assert_ne!(a, b);
    assert_eq!(a.group, "DEFAULT");
  }
}
