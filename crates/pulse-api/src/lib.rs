//! # pulse-api
//!
//! HTTP surface for the Pulse control plane.
//!
//! Provides the instance-registration endpoints (`sync`, `deregister`,
//! `status`), JWKS publication, and health routes, all wrapped in the
//! `{ok, data?, error?}` JSON envelope. The bundled binary also drives the
//! scheduler tick and queue-consumer loops.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod server;
pub mod site_url;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use server::{AppState, Server, build_router};
