//! HTTP handlers: ingress, egress and health.

pub mod health;
pub mod send;
pub mod stream;
