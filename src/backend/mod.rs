//! 后端模块
//! Backend module
//!
//! 定义了共享关系型数据库上的持久化作业存储。集群中的多个调度器
//! 实例通过同一个库上的命名行锁协作，不会重复触发，也不会丢失
//! 在途工作。
//! Defines the persistent job store on a shared relational database.
//! Multiple scheduler instances in a cluster cooperate through named row
//! locks on the same database, without double-firing or losing in-flight
//! work.

pub mod dbstore;

pub use dbstore::DatabaseJobStore;
