pub mod alerts;
pub mod broker;
pub mod cli;
pub mod commands;
pub mod config;
pub mod engine;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod resilience;
pub mod types;
