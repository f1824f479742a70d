//! # toolmesh-core
//!
//! Core types shared across Toolmesh.
//!
//! This crate provides:
//! - Layered configuration (servers, monitoring, load balancing)
//! - Common error types

pub mod config;
pub mod error;

pub use config::{
    CircuitBreakerConfig, Config, LoadBalancingStrategy, MonitoringConfig, ServerConfig,
    TransportConfig,
};
pub use error::{Error, Result};
