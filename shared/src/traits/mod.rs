pub mod stores;

pub use stores::{
    AccountDirectory, ContactDirectory, MessageStore, NotificationStore, WebhookReceiptStore,
};
