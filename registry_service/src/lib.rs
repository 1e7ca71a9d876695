pub mod chain;
pub mod config;
pub mod diff;
pub mod error;
pub mod metrics;
pub mod reconciler;
pub mod update_service;
