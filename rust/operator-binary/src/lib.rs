pub mod clock;
pub mod cluster;
pub mod conditions;
pub mod config_checksum;
pub mod error;
pub mod resource_lock;
pub mod self_monitor;
pub mod utils;
pub mod webhook_cert;
