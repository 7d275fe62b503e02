//! Inbound enrollment webhooks.
//!
//! A delivery moves through signature check, schema validation, dedupe on
//! the event id and enqueue onto the enrollment queue, then is acknowledged.
//! Processing happens later in the enrollment worker; the sender only waits
//! for durable intake.

pub mod event;
pub mod handler;
pub mod signature;

pub use event::{EnrollmentEventType, WebhookEvent};
pub use handler::{WebhookError, receive_webhook};
pub use signature::{sign, verify_signature};
