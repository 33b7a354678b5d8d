pub mod amount;
pub mod chain;
pub mod config;
pub mod contract;
pub mod events;
pub mod keys;
pub mod lightning;
pub mod liquid;
pub mod logging;
pub mod swap;
