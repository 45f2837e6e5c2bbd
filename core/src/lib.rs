//! Core library for per-owner AI provider credentials and clients.
//!
//! Module map:
//! - [`secrets`] loads the process key and seals credentials with AES-256-GCM.
//! - [`registry`] stores provider configurations and keeps one default per owner.
//! - [`providers`] holds one adapter per backend behind the [`providers::ProviderAdapter`] trait.
//! - [`factory`] turns an owner's default configuration into a ready adapter.
//! - [`tester`] probes a candidate configuration before it is trusted.
//! - [`usage`] meters completions and aggregates them per window.
//! - [`model_manager`] is the async facade the application holds.
//! - [`db`], [`logging`], [`config`] and [`errors`] carry the shared plumbing.

pub mod config;
pub mod db;
pub mod errors;
pub mod factory;
pub mod logging;
pub mod model_manager;
pub mod providers;
pub mod registry;
pub mod secrets;
pub mod tester;
pub mod usage;

pub use config::CoreConfig;
pub use errors::{AiError, AiResult};
pub use model_manager::{MediationRequest, ModelManager};
