//! # vmpod-server
//!
//! HTTP front end for a vmpod pod provider. The binary picks a provider
//! from the registry by name, serves it over HTTP and tears every sandbox
//! down on Ctrl-C.

pub mod config;
pub mod http;
pub mod types;

pub use config::ServerConfig;
