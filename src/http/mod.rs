//! HTTP client module
//!
//! Used by configured service checks and by the webhook hook.

mod client;

pub use client::{HttpClient, HttpError, HttpRequest, HttpResponse};
