//! Direct and group chat
//!
//! Direct messages live under the conversation address of the two
//! participants and carry an encrypted body; sender and timestamp stay in
//! the clear. Group messages are plain text and may only be sent by members.
//!
//! Conversation keys are exchanged out of band (see [`crate::key_exchange`])
//! and kept in a [`KeyRing`] stored in the local cache.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::addressing::{conversation_address, participants};
use crate::cache::{CacheError, LocalCache};
use crate::cipher::{self, CipherError, MessageKey};
use crate::error::SyncError;
use crate::identity::UserId;
use crate::ids::IdGenerator;
use crate::key_exchange::KeyPayload;
use crate::models::{Group, Message};
use crate::paths::{self, PathError};
use crate::sync::{Subscription, SyncRepository};

/// Cache namespace for conversation keys
pub const KEY_ENTITY_TYPE: &str = "conversation_keys";

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("No key has been exchanged for conversation {address}")]
    MissingKey { address: String },

    #[error("{user} is not a member of group {group}")]
    NotAMember { user: String, group: String },

    #[error("Conversation {address} does not involve {user}")]
    ForeignConversation { address: String, user: String },

    #[error("Conversation address {address} is not canonical, expected {expected}")]
    NonCanonicalAddress { address: String, expected: String },

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Path(#[from] PathError),
}

/// A message body ready for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenedMessage {
    Plain(String),
    Decrypted(String),
    /// Wrong or missing key, or a corrupted body
    Undecryptable { reason: String },
}

impl OpenedMessage {
    pub fn text(&self) -> &str {
        match self {
            OpenedMessage::Plain(text) | OpenedMessage::Decrypted(text) => text,
            OpenedMessage::Undecryptable { .. } => "[message could not be decrypted]",
        }
    }
}

/// Per-conversation keys of one user
#[derive(Clone)]
pub struct KeyRing {
    cache: Arc<LocalCache>,
    owner: UserId,
}

impl KeyRing {
    pub fn new(cache: Arc<LocalCache>, owner: &UserId) -> Self {
        Self {
            cache,
            owner: owner.clone(),
        }
    }

    /// Generate and store a fresh key for the conversation with `peer`
    ///
    /// The returned payload is what the QR code shows. Sharing again
    /// replaces the previous key.
    pub fn share_with(&self, peer: &UserId) -> Result<KeyPayload, ChatError> {
        let address = conversation_address(&self.owner, peer);
        let key = cipher::generate_key();
        self.insert(&address, &key)?;
        Ok(KeyPayload::new(address, key))
    }

    /// Store a key scanned from the other participant
    ///
    /// The address must name the owner and be in the ordered form that
    /// [`conversation_address`] produces, or the key could never be found
    /// again when sending.
    pub fn accept(&self, payload: &KeyPayload) -> Result<(), ChatError> {
        let foreign = || ChatError::ForeignConversation {
            address: payload.address.clone(),
            user: self.owner.to_string(),
        };
        let (lo, hi) = participants(&payload.address).ok_or_else(foreign)?;
        if lo != self.owner && hi != self.owner {
            return Err(foreign());
        }
        let expected = conversation_address(&lo, &hi);
        if expected != payload.address {
            return Err(ChatError::NonCanonicalAddress {
                address: payload.address.clone(),
                expected,
            });
        }
        self.insert(&payload.address, &payload.key)
    }

    pub fn get(&self, address: &str) -> Result<Option<MessageKey>, ChatError> {
        let Some(record) = self.cache.get(KEY_ENTITY_TYPE, self.owner.as_str(), address)? else {
            return Ok(None);
        };
        let encoded = record
            .payload
            .get("key")
            .and_then(|k| k.as_str())
            .ok_or(CipherError::InvalidEncoding)?;
        Ok(Some(MessageKey::from_base64(encoded)?))
    }

    pub fn insert(&self, address: &str, key: &MessageKey) -> Result<(), ChatError> {
        let payload = json!({
            "key": key.to_base64(),
            "addedAt": Utc::now().timestamp_millis(),
        });
        self.cache
            .upsert(KEY_ENTITY_TYPE, self.owner.as_str(), &[(address.to_string(), payload)])?;
        debug!("Stored key for conversation {}", address);
        Ok(())
    }

    pub fn remove(&self, address: &str) -> Result<bool, ChatError> {
        Ok(self.cache.delete(KEY_ENTITY_TYPE, self.owner.as_str(), address)?)
    }

    pub fn addresses(&self) -> Result<Vec<String>, ChatError> {
        Ok(self
            .cache
            .list(KEY_ENTITY_TYPE, self.owner.as_str())?
            .iter()
            .map(|r| r.id.clone())
            .collect())
    }
}

pub struct ChatService {
    me: UserId,
    messages: SyncRepository<Message>,
    keys: KeyRing,
    ids: &'static IdGenerator,
}

impl ChatService {
    pub fn new(me: UserId, messages: SyncRepository<Message>, keys: KeyRing) -> Self {
        Self {
            me,
            messages,
            keys,
            ids: IdGenerator::global(),
        }
    }

    pub fn keys(&self) -> &KeyRing {
        &self.keys
    }

    pub fn address_with(&self, peer: &UserId) -> String {
        conversation_address(&self.me, peer)
    }

    pub fn share_key(&self, peer: &UserId) -> Result<KeyPayload, ChatError> {
        self.keys.share_with(peer)
    }

    pub fn accept_key(&self, payload: &KeyPayload) -> Result<(), ChatError> {
        self.keys.accept(payload)
    }

    pub async fn send_direct(&self, peer: &UserId, text: &str) -> Result<Message, ChatError> {
        let address = self.address_with(peer);
        let key = self
            .keys
            .get(&address)?
            .ok_or_else(|| ChatError::MissingKey {
                address: address.clone(),
            })?;

        let body = cipher::encrypt(&key, text)?;
        let message = Message::new(self.ids.next_id(), &self.me, body, true);
        self.messages
            .save(&paths::direct_messages(&self.me, peer), &message)
            .await?;
        Ok(message)
    }

    pub async fn send_group(&self, group: &Group, text: &str) -> Result<Message, ChatError> {
        if !group.is_member(&self.me) {
            return Err(ChatError::NotAMember {
                user: self.me.to_string(),
                group: group.id.clone(),
            });
        }

        let message = Message::new(self.ids.next_id(), &self.me, text.to_string(), false);
        self.messages
            .save(&paths::group_chat(&group.id)?, &message)
            .await?;
        Ok(message)
    }

    pub fn observe_direct(&self, peer: &UserId) -> Result<Subscription<Message>, ChatError> {
        Ok(self
            .messages
            .observe(&paths::direct_messages(&self.me, peer))?)
    }

    pub fn observe_group(&self, group_id: &str) -> Result<Subscription<Message>, ChatError> {
        Ok(self.messages.observe(&paths::group_chat(group_id)?)?)
    }

    /// Turn a stored message into display text
    ///
    /// `address` is the conversation the message came from. Failures to
    /// decrypt are reported in the result, never as an error.
    pub fn open(&self, address: &str, message: &Message) -> OpenedMessage {
        if !message.encrypted {
            return OpenedMessage::Plain(message.body.clone());
        }

        let key = match self.keys.get(address) {
            Ok(Some(key)) => key,
            Ok(None) => {
                return OpenedMessage::Undecryptable {
                    reason: format!("no key for conversation {}", address),
                }
            }
            Err(e) => {
                return OpenedMessage::Undecryptable {
                    reason: e.to_string(),
                }
            }
        };

        match cipher::decrypt(&key, &message.body) {
            Ok(text) => OpenedMessage::Decrypted(text),
            Err(e) => OpenedMessage::Undecryptable {
                reason: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemoteStore;
    use crate::sync::ListenerRegistry;
    use std::collections::BTreeSet;
    use std::time::Duration;

    struct Fixture {
        remote: Arc<MemoryRemoteStore>,
        alice: ChatService,
        bob: ChatService,
    }

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    /// Two users on two devices sharing one server
    fn fixture() -> Fixture {
        let remote = Arc::new(MemoryRemoteStore::new());
        let service = |me: &str| {
            let cache = Arc::new(LocalCache::open_in_memory().unwrap());
            let registry = Arc::new(ListenerRegistry::new(
                remote.clone(),
                cache.clone(),
                Duration::ZERO,
            ));
            ChatService::new(
                user(me),
                SyncRepository::new(registry),
                KeyRing::new(cache, &user(me)),
            )
        };
        Fixture {
            alice: service("alice"),
            bob: service("bob"),
            remote,
        }
    }

    #[tokio::test]
    async fn test_direct_message_roundtrip() {
        let f = fixture();
        let payload = f.alice.share_key(&user("bob")).unwrap();
        f.bob.accept_key(&KeyPayload::parse(&payload.encode()).unwrap()).unwrap();

        let mut inbox = f.bob.observe_direct(&user("alice")).unwrap();
        let sent = f.alice.send_direct(&user("bob"), "see you at 9 ☕").await.unwrap();
        assert!(sent.encrypted);
        assert_ne!(sent.body, "see you at 9 ☕");

        let received = inbox.wait_for(|m| !m.is_empty()).await.unwrap();
        let opened = f.bob.open(&f.bob.address_with(&user("alice")), &received[0]);
        assert_eq!(opened, OpenedMessage::Decrypted("see you at 9 ☕".to_string()));
    }

    #[tokio::test]
    async fn test_send_without_key() {
        let f = fixture();
        let err = f.alice.send_direct(&user("bob"), "hi").await.unwrap_err();
        assert!(matches!(err, ChatError::MissingKey { .. }));
        assert!(f.remote.value(&paths::direct_messages(&user("alice"), &user("bob"))).is_none());
    }

    #[tokio::test]
    async fn test_wrong_key_is_undecryptable() {
        let f = fixture();
        f.alice.share_key(&user("bob")).unwrap();
        // Bob holds a different key for the same conversation
        f.bob.share_key(&user("alice")).unwrap();

        let sent = f.alice.send_direct(&user("bob"), "secret").await.unwrap();
        let opened = f.bob.open(&f.bob.address_with(&user("alice")), &sent);
        assert_ne!(opened, OpenedMessage::Decrypted("secret".to_string()));
        assert_ne!(opened.text(), "secret");
    }

    #[test]
    fn test_open_plain_and_missing_key() {
        let f = fixture();
        let plain = Message::new("m1".to_string(), &user("bob"), "hello".to_string(), false);
        assert_eq!(
            f.alice.open("any", &plain),
            OpenedMessage::Plain("hello".to_string())
        );

        let locked = Message::new("m2".to_string(), &user("bob"), "AAAA".to_string(), true);
        assert!(matches!(
            f.alice.open("3-bobalice", &locked),
            OpenedMessage::Undecryptable { .. }
        ));
    }

    #[tokio::test]
    async fn test_group_membership_enforced() {
        let f = fixture();
        let group = Group {
            id: "g1".to_string(),
            name: "Study".to_string(),
            members: BTreeSet::from(["alice".to_string()]),
            created_by: "alice".to_string(),
        };

        let sent = f.alice.send_group(&group, "welcome").await.unwrap();
        assert!(!sent.encrypted);
        assert!(f.remote.value(&paths::group_chat("g1").unwrap()).is_some());

        assert!(matches!(
            f.bob.send_group(&group, "let me in").await,
            Err(ChatError::NotAMember { .. })
        ));
    }

    #[test]
    fn test_accept_foreign_key_rejected() {
        let f = fixture();
        let payload = KeyPayload::new(
            conversation_address(&user("carol"), &user("dave")),
            cipher::generate_key(),
        );
        assert!(matches!(
            f.alice.accept_key(&payload),
            Err(ChatError::ForeignConversation { .. })
        ));
    }

    #[tokio::test]
    async fn test_accept_reordered_address_rejected() {
        let f = fixture();
        let key = cipher::generate_key();
        let reordered = KeyPayload::new("3-bobalice".to_string(), key.clone());
        assert!(matches!(
            f.alice.accept_key(&reordered),
            Err(ChatError::NonCanonicalAddress { expected, .. }) if expected == "5-alicebob"
        ));
        assert!(matches!(
            f.alice.send_direct(&user("bob"), "hi").await,
            Err(ChatError::MissingKey { .. })
        ));

        let canonical = KeyPayload::new(conversation_address(&user("bob"), &user("alice")), key);
        f.alice.accept_key(&canonical).unwrap();
        f.alice.send_direct(&user("bob"), "hi").await.unwrap();
    }

    #[test]
    fn test_keyring_persists_by_owner() {
        let cache = Arc::new(LocalCache::open_in_memory().unwrap());
        let alice = KeyRing::new(cache.clone(), &user("alice"));
        let other = KeyRing::new(cache, &user("bob"));
        let key = cipher::generate_key();

        alice.insert("5-alicebob", &key).unwrap();
        assert_eq!(alice.get("5-alicebob").unwrap(), Some(key));
        assert_eq!(alice.addresses().unwrap(), vec!["5-alicebob"]);
        assert!(other.get("5-alicebob").unwrap().is_none());

        assert!(alice.remove("5-alicebob").unwrap());
        assert!(alice.get("5-alicebob").unwrap().is_none());
    }
}
