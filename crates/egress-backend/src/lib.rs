//! Egress Backend - production network client
//!
//! Talks to the egress controller over HTTPS (hyper + rustls) and
//! implements [`egress_device::NetworkClient`] on top of it.

mod client;
mod http;

pub use client::{BackendClient, BackendConfig, DEFAULT_ENDPOINT};
pub use http::{HttpClient, HttpClientConfig, HttpError, Response};
