// Library for tests to access modules

pub mod backfill;
pub mod catalog;
pub mod collector;
pub mod config;
pub mod context;
pub mod error;
pub mod hub_repo;
pub mod meter;
pub mod models;
pub mod retention_worker;
pub mod scheduler;
pub mod store_repo;
pub mod task_manager;
pub mod version;
pub mod watchdog;
pub mod worker;
