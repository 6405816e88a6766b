//! Common types and utilities shared across apiscope crates.
//!
//! This crate defines the shared error type, a handful of enums that both the
//! configuration layer and the session layer need, and the centralised
//! tracing/logging initialisation. It is intentionally lightweight and
//! dependency-minimal so that every crate can depend on it without pulling in
//! heavy transitive costs.
//!
//! # Overview
//!
//! - [`ScopeError`] and [`Result`]: Shared error handling
//! - [`observability`]: Centralised tracing/logging initialisation
//! - [`ConsentMode`] / [`ConsentAction`]: interstitial-handler selection
use serde::{Deserialize, Serialize};

pub mod observability;

/// How interstitial/consent handlers are selected for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentMode {
    /// Try every registered handler against every frame.
    Auto,
    /// Never attempt interstitial dismissal.
    Off,
    /// Only the Yahoo-family handler.
    Yahoo,
    /// Only the generic cookie-banner handler.
    Generic,
}

impl Default for ConsentMode {
    fn default() -> Self {
        Self::Auto
    }
}

/// Which button family a consent handler should press.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentAction {
    Reject,
    Accept,
}

impl Default for ConsentAction {
    fn default() -> Self {
        Self::Reject
    }
}

/// Error types used across the apiscope system.
#[derive(thiserror::Error, Debug)]
pub enum ScopeError {
    /// Configuration was incomplete or an invalid combination.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The browser session (or another external collaborator) reported an error.
    #[error("Session error: {0}")]
    Session(#[from] anyhow::Error),

    /// A capture artifact could not be created or written.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Operation exceeded the configured deadline.
    #[error("Timeout occurred")]
    Timeout,
}

/// Convenient alias for results that use [`ScopeError`].
pub type Result<T> = std::result::Result<T, ScopeError>;
