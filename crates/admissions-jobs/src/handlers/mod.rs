//! Job handlers for the portal's queues.
//!
//! Each handler reaches the outside world (database, SMTP) through a small
//! trait so the worker can be exercised against fakes.

pub mod email;
pub mod enrollment;
pub mod export;

pub use email::{
    EmailMessage, EmailTransport, NotificationEmailHandler, NotificationEmailJob, SmtpTransport,
};
pub use enrollment::{AppliedEnrollment, EnrollmentEventHandler, EnrollmentSink, EnrollmentUpdate};
pub use export::{ApplicantRow, ApplicantSource, ExportHandler, ExportRequest};
