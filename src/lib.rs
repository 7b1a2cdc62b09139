//! Agent Board — a kanban board that dispatches tickets to coding agents.

pub mod app;
pub mod board;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod reconcile;
pub mod store;
