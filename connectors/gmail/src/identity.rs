use shared::{Contact, ContactDirectory, EmailMessage, MessageStore};
use std::sync::Arc;
use tracing::debug;

use crate::content;
use crate::error::Result;
use crate::gmail::GmailMessage;

#[derive(Debug, Clone)]
pub enum Resolution {
    /// `stored` is the record with the same provider id; a thread and time
    /// match carries none.
    Duplicate { stored: Option<EmailMessage> },
    NotCorrelated { sender: Option<String> },
    Correlated { contact: Contact, sender: String },
}

/// Pulls the bare address out of a `From`-style header:
/// `"Bob Smith" <Bob@Customer.com>` and `bob@customer.com` both give
/// `bob@customer.com`.
pub fn extract_address(header: &str) -> Option<String> {
    let candidate = match (header.rfind('<'), header.rfind('>')) {
        (Some(open), Some(close)) if open < close => &header[open + 1..close],
        _ => header,
    };

    let address = candidate
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .trim()
        .to_lowercase();

    let valid = address.contains('@')
        && !address.starts_with('@')
        && !address.ends_with('@')
        && !address.chars().any(char::is_whitespace);

    valid.then_some(address)
}

#[derive(Clone)]
pub struct IdentityResolver {
    messages: Arc<dyn MessageStore>,
    contacts: Arc<dyn ContactDirectory>,
}

impl IdentityResolver {
    pub fn new(messages: Arc<dyn MessageStore>, contacts: Arc<dyn ContactDirectory>) -> Self {
        Self { messages, contacts }
    }

    /// `workspace_ids` is the owning user's workspace scope, in lookup order.
    pub async fn resolve(
        &self,
        user_id: &str,
        workspace_ids: &[String],
        message: &GmailMessage,
    ) -> Result<Resolution> {
        if let Some(stored) = self.messages.find_by_message_id(&message.id).await? {
            return Ok(Resolution::Duplicate {
                stored: Some(stored),
            });
        }

        let sent_at = content::sent_at(message);
        if self
            .messages
            .find_by_thread_and_time(user_id, &message.thread_id, sent_at)
            .await?
            .is_some()
        {
            debug!(
                "Message {} matches an owned thread {} at {}",
                message.id, message.thread_id, sent_at
            );
            return Ok(Resolution::Duplicate { stored: None });
        }

        let Some(sender) = content::header_value(message, "From")
            .as_deref()
            .and_then(extract_address)
        else {
            return Ok(Resolution::NotCorrelated { sender: None });
        };

        match self.contacts.find_by_email(&sender, workspace_ids).await? {
            Some(contact) => Ok(Resolution::Correlated { contact, sender }),
            None => Ok(Resolution::NotCorrelated {
                sender: Some(sender),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared::memory::{MemoryContactDirectory, MemoryMessageStore};
    use shared::{MessageDirection, NewEmailMessage};

    #[test]
    fn test_extract_address() {
        assert_eq!(
            extract_address("\"Bob Smith\" <Bob@Customer.com>").as_deref(),
            Some("bob@customer.com")
        );
        assert_eq!(
            extract_address("  carol@example.org ").as_deref(),
            Some("carol@example.org")
        );
        assert_eq!(extract_address("Undisclosed recipients"), None);
        assert_eq!(extract_address("<>"), None);
        assert_eq!(extract_address(""), None);
    }

    fn raw_message(id: &str, from: Option<&str>) -> GmailMessage {
        let headers = match from {
            Some(from) => json!([{"name": "From", "value": from}]),
            None => json!([]),
        };
        serde_json::from_value(json!({
            "id": id,
            "threadId": "thread-1",
            "internalDate": "1700000000000",
            "payload": {"mimeType": "text/plain", "headers": headers}
        }))
        .unwrap()
    }

    async fn resolver() -> (IdentityResolver, MemoryMessageStore) {
        let messages = MemoryMessageStore::new();
        let contacts = MemoryContactDirectory::new();
        contacts
            .add_contact("contact-bob", "ws-1", "bob@customer.com", Some("Bob"))
            .await;
        let resolver = IdentityResolver::new(Arc::new(messages.clone()), Arc::new(contacts));
        (resolver, messages)
    }

    #[tokio::test]
    async fn test_correlates_known_sender_within_workspace() {
        let (resolver, _) = resolver().await;
        let workspaces = vec!["ws-1".to_string()];

        let resolution = resolver
            .resolve("user-1", &workspaces, &raw_message("m1", Some("Bob <BOB@customer.com>")))
            .await
            .unwrap();

        match resolution {
            Resolution::Correlated { contact, sender } => {
                assert_eq!(contact.id, "contact-bob");
                assert_eq!(sender, "bob@customer.com");
            }
            other => panic!("expected correlation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sender_outside_workspace_scope_is_not_correlated() {
        let (resolver, _) = resolver().await;
        let workspaces = vec!["ws-other".to_string()];

        let resolution = resolver
            .resolve("user-1", &workspaces, &raw_message("m1", Some("bob@customer.com")))
            .await
            .unwrap();

        assert!(matches!(resolution, Resolution::NotCorrelated { sender: Some(_) }));
    }

    #[tokio::test]
    async fn test_unparseable_sender_is_not_correlated() {
        let (resolver, _) = resolver().await;
        let workspaces = vec!["ws-1".to_string()];

        let resolution = resolver
            .resolve("user-1", &workspaces, &raw_message("m1", None))
            .await
            .unwrap();

        assert!(matches!(resolution, Resolution::NotCorrelated { sender: None }));
    }

    #[tokio::test]
    async fn test_known_message_id_and_thread_time_are_duplicates() {
        let (resolver, messages) = resolver().await;
        let workspaces = vec!["ws-1".to_string()];
        let existing = raw_message("m1", Some("bob@customer.com"));

        messages
            .insert(NewEmailMessage {
                user_id: "user-1".to_string(),
                workspace_id: "ws-1".to_string(),
                contact_id: Some("contact-bob".to_string()),
                counterpart: "bob@customer.com".to_string(),
                subject: "Hi".to_string(),
                body: "Hello".to_string(),
                direction: MessageDirection::Received,
                thread_id: existing.thread_id.clone(),
                message_id: existing.id.clone(),
                sent_at: content::sent_at(&existing),
                attachments: vec![],
            })
            .await
            .unwrap();

        let same_id = resolver.resolve("user-1", &workspaces, &existing).await.unwrap();
        assert!(matches!(
            same_id,
            Resolution::Duplicate { stored: Some(ref stored) } if stored.message_id == "m1"
        ));

        // Redelivered under a different id but same thread and timestamp.
        let same_thread_time = raw_message("m1-redelivered", Some("bob@customer.com"));
        let resolution = resolver
            .resolve("user-1", &workspaces, &same_thread_time)
            .await
            .unwrap();
        assert!(matches!(resolution, Resolution::Duplicate { stored: None }));

        // A different user owning nothing in that thread is not a duplicate.
        let other_user = resolver
            .resolve("user-2", &workspaces, &same_thread_time)
            .await
            .unwrap();
        assert!(matches!(other_user, Resolution::Correlated { .. }));
    }
}
