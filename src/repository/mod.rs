pub mod compat;
pub mod config;
pub mod mutex;
pub mod restic;
pub mod service;
