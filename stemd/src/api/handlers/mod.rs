//! HTTP request handlers.
//!
//! - [`upload`]: `POST /upload`, store the file and run the separation tool on it

pub mod upload;
