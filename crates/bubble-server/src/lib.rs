//! # bubble-server
//!
//! Daemon library for the bubble proximity access-control engine.
//!
//! This library starts the engine coordinator and exposes its state and
//! triggers over a REST API.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod logging;
pub mod state;
