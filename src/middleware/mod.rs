//! Axum middleware for rate limiting.
//!
//! Provides Tower-compatible layers for integrating rate limiting into Axum applications.
//!
//! # Example
//!
//! ```ignore
//! use axum::{Router, routing::get};
//! use throttle_gate::{
//!     middleware::RateLimitLayer,
//!     GCRA, Quota, MemoryStorage,
//!     key::IpKey,
//! };
//!
//! let storage = MemoryStorage::new();
//!
//! let app = Router::new()
//!     .route("/api/data", get(handler))
//!     .layer(RateLimitLayer::new(
//!         storage,
//!         GCRA::new(),
//!         Quota::per_second(10),
//!         IpKey::new(),
//!     ));
//! ```

#[cfg(feature = "axum")]
mod layer;

#[cfg(feature = "actix")]
pub mod actix;

#[cfg(feature = "composer")]
pub mod pipeline;

#[cfg(feature = "axum")]
pub use layer::RateLimitLayer;

#[cfg(all(feature = "composer", feature = "axum"))]
pub use layer::{AxumRequestParts, PipelineLayer, PipelineService};

#[cfg(feature = "composer")]
pub use pipeline::{MiddlewareConfig, RenderedResponse, Verdict};
