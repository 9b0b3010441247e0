#![allow(dead_code)]

pub mod mock_gmail;

use axum_test::TestServer;
use crm_gmail_connector::api::{create_router, ApiState};
use crm_gmail_connector::gmail::GmailClient;
use crm_gmail_connector::{MailSyncEngine, Stores};
use shared::config::{
    DatabaseConfig, GmailConnectorConfig, GoogleOAuthConfig, StorageBackendKind, StorageConfig,
    SyncConfig,
};
use shared::memory::{
    MemoryAccountDirectory, MemoryContactDirectory, MemoryMessageStore, MemoryNotificationStore,
    MemoryWebhookReceiptStore,
};
use shared::storage::MemoryStorage;
use shared::{AccountDirectory, SyncCursor};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use mock_gmail::MockGmailServer;

pub const USER_ID: &str = "user-alice";
pub const USER_EMAIL: &str = "alice@biz.com";
pub const WORKSPACE_ID: &str = "ws-acme";
pub const CONTACT_ID: &str = "contact-bob";
pub const CONTACT_EMAIL: &str = "bob@customer.com";
pub const FRONTEND_URL: &str = "https://crm.example.com";

pub fn test_config(mock: &MockGmailServer) -> GmailConnectorConfig {
    GmailConnectorConfig {
        port: 0,
        database: DatabaseConfig {
            database_url: "postgresql://unused".to_string(),
            max_connections: 1,
            acquire_timeout_seconds: 1,
        },
        storage: StorageConfig {
            backend: StorageBackendKind::Postgres,
            s3_bucket: None,
            s3_region: None,
            s3_endpoint: None,
            public_base_url: "/files".to_string(),
            timeout_seconds: 5,
        },
        oauth: GoogleOAuthConfig {
            client_id: "client-id".to_string(),
            client_secret: "client-secret".to_string(),
            token_url: mock.token_url(),
        },
        sync: SyncConfig::default(),
        gmail_api_base: mock.api_base(),
        pubsub_topic: Some("projects/crm/topics/gmail".to_string()),
        frontend_url: FRONTEND_URL.to_string(),
        provider_timeout_seconds: 5,
        api_rate_limit: 100,
        max_retries: 1,
    }
}

/// An engine wired to in-memory stores and the mock provider, with one
/// linked mailbox and one known contact.
pub struct Harness {
    pub mock: MockGmailServer,
    pub engine: MailSyncEngine,
    pub accounts: MemoryAccountDirectory,
    pub contacts: MemoryContactDirectory,
    pub messages: MemoryMessageStore,
    pub notifications: MemoryNotificationStore,
    pub receipts: MemoryWebhookReceiptStore,
    pub storage: MemoryStorage,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_cursor(None).await
    }

    pub async fn with_cursor(cursor: Option<SyncCursor>) -> Self {
        Self::build(cursor, |_| {}).await
    }

    pub async fn build(
        cursor: Option<SyncCursor>,
        configure: impl FnOnce(&mut GmailConnectorConfig),
    ) -> Self {
        let mock = MockGmailServer::start().await;
        let mut config = test_config(&mock);
        configure(&mut config);

        let accounts = MemoryAccountDirectory::new();
        accounts
            .add_account(USER_ID, USER_EMAIL, Some("refresh-secret"), cursor, &[WORKSPACE_ID])
            .await;
        let contacts = MemoryContactDirectory::new();
        contacts
            .add_contact(CONTACT_ID, WORKSPACE_ID, CONTACT_EMAIL, Some("Bob"))
            .await;

        let messages = MemoryMessageStore::new();
        let notifications = MemoryNotificationStore::new();
        let receipts = MemoryWebhookReceiptStore::new();
        let storage = MemoryStorage::new();

        let stores = Stores {
            accounts: Arc::new(accounts.clone()),
            contacts: Arc::new(contacts.clone()),
            messages: Arc::new(messages.clone()),
            notifications: Arc::new(notifications.clone()),
            webhook_receipts: Arc::new(receipts.clone()),
            storage: Arc::new(storage.clone()),
        };

        let gmail = GmailClient::new(
            config.gmail_api_base.clone(),
            Duration::from_secs(config.provider_timeout_seconds),
            config.api_rate_limit,
            config.max_retries,
        )
        .unwrap()
        .with_retry_base_delay(Duration::from_millis(5));

        let engine = MailSyncEngine::with_client(&config, stores, gmail).unwrap();

        Self {
            mock,
            engine,
            accounts,
            contacts,
            messages,
            notifications,
            receipts,
            storage,
        }
    }

    pub fn server(&self) -> TestServer {
        TestServer::new(create_router(ApiState {
            engine: self.engine.clone(),
        }))
        .unwrap()
    }

    pub async fn stored_cursor(&self) -> Option<SyncCursor> {
        self.accounts
            .find_by_id(USER_ID)
            .await
            .unwrap()
            .and_then(|account| account.cursor())
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
