//! USB driver broker - binds and unbinds a managed USB driver on request
//! from unprivileged local clients, gated by administrator filter rules.

pub mod commands;
pub mod config;
pub mod filter;
pub mod gateway;
pub mod platform;
pub mod protocol;
pub mod server;
