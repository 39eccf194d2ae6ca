//! HTTP and WebSocket API handlers

pub mod batch;
pub mod health;
pub mod ws;
