//! # state-relay
//!
//! A WebSocket relay that fans out application state from a single admin
//! publisher to any number of viewers. Viewers joining late are sent the most
//! recent state as soon as they say hello.

pub mod config;
pub mod server;
pub mod utils;
