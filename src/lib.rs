pub mod config;
pub mod engine;
pub mod forms;
pub mod http;
pub mod limits;
pub mod model;
pub mod observability;
pub mod reaper;
pub mod repository;
pub mod session;
pub mod wal;
pub mod workflow;
