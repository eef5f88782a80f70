//! 内存作业存储模块
//! In-memory job store module
//!
//! 定义了基于内存的作业存储，不依赖任何外部服务；语义与持久化存储
//! 一致，但不参与集群协调。
//! Defines the in-memory job store without any external service
//! dependencies; semantics match the persistent store, minus cluster
//! coordination.

mod ram_store;
mod store;

pub use ram_store::RamJobStore;
