//! Orzbob control plane: scheduler and session gateway for short-lived
//! developer sandboxes.
//!
//! The library is organized around a handful of independently testable
//! services composed by the server binary:
//!
//! - [`provider`] — CRUD over sandbox instances and secrets (fake + Docker)
//! - [`auth`] — ES256 capability tokens, identity exchange, user store
//! - [`heartbeat`] — last-activity registry and the idle reaper
//! - [`throttle`] — continuous/daily/idle run limits with pause callbacks
//! - [`billing`] — quota accounting, usage metering, budget alerts
//! - [`api`] — the `/v1` REST surface and the WebSocket attach proxy

#![allow(missing_docs)] // TODO: enforce once the public API surface settles

pub mod api;
pub mod auth;
pub mod billing;
pub mod config;
pub mod email;
pub mod heartbeat;
pub mod logging;
pub mod metrics;
pub mod provider;
pub mod terminal;
pub mod throttle;
