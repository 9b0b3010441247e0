pub mod api;
pub mod attachments;
pub mod auth;
pub mod content;
pub mod deletion;
pub mod delta;
pub mod engine;
pub mod error;
pub mod gmail;
pub mod identity;
pub mod mime;
pub mod models;
pub mod outbound;
pub mod realtime;
pub mod sync;
pub mod watch;
pub mod webhook;

pub use engine::{MailSyncEngine, Stores};
pub use error::{MailSyncError, Result};
