pub mod cli;
pub mod config;
pub mod context;
pub mod cron;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod mount;
pub mod notify;
pub mod repository;
pub mod scheduler;
pub mod secrets;
pub mod types;
pub mod util;
pub mod volume;
