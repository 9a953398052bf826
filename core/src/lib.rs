pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod monitoring;
pub mod rules;
pub mod screening;
pub mod snapshot;
pub mod store;
pub mod task;
pub mod types;
