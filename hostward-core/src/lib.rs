//! Hostward library exports

pub mod config;
pub mod trust;

pub use config::TrustConfig;
