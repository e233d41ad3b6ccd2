//! Virtual room staging service.
//!
//! Accepts a room photo, hands it to a third-party AI staging provider, and
//! tracks the provider job until it completes, fails or times out. Providers
//! report completion either by polling or by webhook; both paths resolve the
//! job record exactly once.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
