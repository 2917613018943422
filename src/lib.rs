pub mod api;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod events;
pub mod gateway;
pub mod limits;
pub mod model;
pub mod observability;
pub mod publisher;
pub mod wal;
