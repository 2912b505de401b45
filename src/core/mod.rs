//! Core application modules
//!
//! Configuration, constants, logging, the provider abstraction with its
//! implementations, model resolution and the retrying gateway.

pub mod config;
pub mod constants;
pub mod gateway;
pub mod logging;
pub mod model_registry;
pub mod provider;
pub mod providers;
