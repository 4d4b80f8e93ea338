//! API route handlers

pub mod dispatch;
pub mod health;
pub mod targets;
