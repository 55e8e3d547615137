//! API layer for HTTP request handling and data models.
//!
//! - **[`handlers`]**: Axum route handlers
//! - **[`models`]**: Response bodies
//!
//! Static assets are not handled here; they are served straight from the public directory by
//! the router's fallback service.

pub mod handlers;
pub mod models;
