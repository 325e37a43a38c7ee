//! Infrastructure layer: job queue, storage adapters, ports, config.

pub mod bridge;
pub mod config;
pub mod jobs;
pub mod ports;

pub use bridge::{EmailBridge, EmailDelivery, WebhookBridge, WebhookDelivery};
pub use config::JobsConfig;
