pub mod config;
pub mod db;
pub mod memory;
pub mod models;
pub mod rate_limiter;
pub mod storage;
pub mod telemetry;
pub mod test_environment;
pub mod traits;
pub mod utils;

pub use config::{DatabaseConfig, GmailConnectorConfig, StorageConfig, SyncConfig};
pub use db::repositories::{
    ContactRepository, MessageRepository, NotificationRepository, UserRepository,
    WebhookReceiptRepository,
};
pub use db::{DatabaseError, DatabasePool};
pub use models::*;
pub use rate_limiter::{RateLimiter, RetryableError};
pub use storage::{DownloadedObject, ObjectStorage, StorageError, StoredObject};
pub use traits::{
    AccountDirectory, ContactDirectory, MessageStore, NotificationStore, WebhookReceiptStore,
};
