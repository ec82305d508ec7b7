//! Persisted entities: patient/study/series/instance, exports, imports,
//! rulesets, transactions, service status, config. Single writer per entity;
//! strongly-typed enums. Per spec.md §3.

mod db;
mod models;
mod repo;

pub use db::connect_pool;
pub use models::*;
pub use repo::CatalogRepo;
