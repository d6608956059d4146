//! HTTP gateway for the Assay orchestrator.
//!
//! Exposes task submission and polling, worker heartbeats, and the health
//! surface over axum, and delivers HMAC-signed completion webhooks.

pub mod error;
pub mod middleware;
pub mod server;
pub mod webhook;

pub use error::ApiError;
pub use middleware::AuthConfig;
pub use server::{CreateTaskRequest, GatewayServer};
pub use webhook::{sign_payload, verify_signature, WebhookNotifier, SIGNATURE_HEADER};
