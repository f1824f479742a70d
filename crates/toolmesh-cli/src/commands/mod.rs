//! CLI command implementations.

pub mod check;
pub mod doctor;
pub mod health;
pub mod reconnect;
pub mod select;
pub mod servers;
