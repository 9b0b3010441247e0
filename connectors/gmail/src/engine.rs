use shared::config::GmailConnectorConfig;
use shared::{
    AccountDirectory, ContactDirectory, ContactRepository, DatabasePool, MessageRepository,
    MessageStore, NotificationRepository, NotificationStore, ObjectStorage, UserRepository,
    WebhookReceiptRepository, WebhookReceiptStore,
};
use std::sync::Arc;
use std::time::Duration;

use crate::attachments::AttachmentOffloader;
use crate::auth::CredentialRefresher;
use crate::deletion::MessageDeleter;
use crate::delta::DeltaFetcher;
use crate::gmail::GmailClient;
use crate::identity::IdentityResolver;
use crate::outbound::OutboundSender;
use crate::realtime::RealtimeNotifier;
use crate::sync::{IngestionPipeline, PipelineParts};
use crate::webhook::{SpawningDispatcher, SyncDispatcher, WebhookIntake};
use crate::watch::WatchRegistrar;

/// The datastore and object storage collaborators.
#[derive(Clone)]
pub struct Stores {
    pub accounts: Arc<dyn AccountDirectory>,
    pub contacts: Arc<dyn ContactDirectory>,
    pub messages: Arc<dyn MessageStore>,
    pub notifications: Arc<dyn NotificationStore>,
    pub webhook_receipts: Arc<dyn WebhookReceiptStore>,
    pub storage: Arc<dyn ObjectStorage>,
}

impl Stores {
    pub fn postgres(db: &DatabasePool, storage: Arc<dyn ObjectStorage>) -> Self {
        let pool = db.pool();
        Self {
            accounts: Arc::new(UserRepository::new(pool)),
            contacts: Arc::new(ContactRepository::new(pool)),
            messages: Arc::new(MessageRepository::new(pool)),
            notifications: Arc::new(NotificationRepository::new(pool)),
            webhook_receipts: Arc::new(WebhookReceiptRepository::new(pool)),
            storage,
        }
    }
}

#[derive(Clone)]
pub struct MailSyncEngine {
    pub pipeline: Arc<IngestionPipeline>,
    pub webhook: WebhookIntake,
    pub outbound: OutboundSender,
    pub deletion: MessageDeleter,
    pub watch: WatchRegistrar,
    pub realtime: RealtimeNotifier,
    pub storage: Arc<dyn ObjectStorage>,
}

impl MailSyncEngine {
    pub fn new(config: &GmailConnectorConfig, stores: Stores) -> Result<Self, reqwest::Error> {
        let gmail = GmailClient::new(
            config.gmail_api_base.clone(),
            Duration::from_secs(config.provider_timeout_seconds),
            config.api_rate_limit,
            config.max_retries,
        )?;
        Self::with_client(config, stores, gmail)
    }

    pub fn with_client(
        config: &GmailConnectorConfig,
        stores: Stores,
        gmail: GmailClient,
    ) -> Result<Self, reqwest::Error> {
        let credentials = CredentialRefresher::new(
            config.oauth.clone(),
            stores.accounts.clone(),
            Duration::from_secs(config.provider_timeout_seconds),
        )?;
        let realtime = RealtimeNotifier::new();
        let offloader = AttachmentOffloader::new(
            stores.storage.clone(),
            gmail.clone(),
            config.sync.attachment_folder.clone(),
            Duration::from_secs(config.storage.timeout_seconds),
            config.sync.max_messages_in_flight,
        );

        let pipeline = Arc::new(IngestionPipeline::new(
            PipelineParts {
                credentials: credentials.clone(),
                gmail: gmail.clone(),
                delta: DeltaFetcher::new(
                    gmail.clone(),
                    config.sync.history_page_size,
                    config.sync.fallback_scan_size,
                ),
                resolver: IdentityResolver::new(stores.messages.clone(), stores.contacts.clone()),
                offloader: offloader.clone(),
                accounts: stores.accounts.clone(),
                messages: stores.messages.clone(),
                notifications: stores.notifications.clone(),
                realtime: realtime.clone(),
            },
            &config.sync,
            config.frontend_url.clone(),
        ));

        let dispatcher: Arc<dyn SyncDispatcher> =
            Arc::new(SpawningDispatcher::new(pipeline.clone()));

        Ok(Self {
            webhook: WebhookIntake::new(
                stores.accounts.clone(),
                stores.webhook_receipts.clone(),
                dispatcher,
            ),
            outbound: OutboundSender {
                credentials: credentials.clone(),
                gmail: gmail.clone(),
                offloader,
                accounts: stores.accounts.clone(),
                contacts: stores.contacts.clone(),
                messages: stores.messages.clone(),
                realtime: realtime.clone(),
            },
            deletion: MessageDeleter::new(stores.messages.clone(), stores.storage.clone()),
            storage: stores.storage,
            watch: WatchRegistrar::new(
                credentials,
                gmail,
                stores.accounts,
                config.pubsub_topic.clone(),
            ),
            pipeline,
            realtime,
        })
    }
}
