pub mod contact;
pub mod message;
pub mod notification;
pub mod user;
pub mod webhook_receipt;

pub use contact::ContactRepository;
pub use message::MessageRepository;
pub use notification::NotificationRepository;
pub use user::UserRepository;
pub use webhook_receipt::WebhookReceiptRepository;
