//! Configuration for a nodegate node: schema, discovery and loading.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{data_dir, discover_and_load, find_config_file, load_config},
    schema::{ConfigError, GatewayConfig, NodegateConfig},
};
