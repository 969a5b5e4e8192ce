pub mod config;
pub mod device_plugin;
pub mod logging;
pub mod manager;
