//! Versioned registry of relayable event types.
//!
//! Maps a stable tag (the event's simple type name) plus a schema version
//! to a decoder and the internal topic the event is republished on.

use std::collections::HashMap;

use domain::{ChatEvent, DomainEvent, FriendAddedEvent, MentionEvent, MessageSentEvent};

use crate::error::{RelayError, Result};

/// Schema version assumed when a record carries none.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

type Decoder = fn(&str) -> serde_json::Result<ChatEvent>;

fn decode_as<E: DomainEvent + Into<ChatEvent>>(payload: &str) -> serde_json::Result<ChatEvent> {
    serde_json::from_str::<E>(payload).map(Into::into)
}

/// Registry entry for one event tag at one schema version.
#[derive(Clone)]
pub struct EventDescriptor {
    pub tag: &'static str,
    pub version: u32,
    /// Internal topic the decoded event is republished on.
    pub topic: String,
    decode: Decoder,
}

impl std::fmt::Debug for EventDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDescriptor")
            .field("tag", &self.tag)
            .field("version", &self.version)
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl EventDescriptor {
    /// Decodes a payload as this event.
    pub fn decode(&self, payload: &str) -> Result<ChatEvent> {
        (self.decode)(payload).map_err(|source| RelayError::Decode {
            event_type: self.tag.to_string(),
            source,
        })
    }
}

/// Lookup table from `(tag, version)` to [`EventDescriptor`].
#[derive(Debug, Clone, Default)]
pub struct EventRegistry {
    entries: HashMap<(String, u32), EventDescriptor>,
}

impl EventRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the chat domain events at the current schema version.
    ///
    /// Internal topics are `<prefix>.message.sent`, `<prefix>.message.mention`
    /// and `<prefix>.friend.added`.
    pub fn chat_events(topic_prefix: &str) -> Self {
        let mut registry = Self::new();
        registry
            .register::<MessageSentEvent>(
                CURRENT_SCHEMA_VERSION,
                format!("{topic_prefix}.message.sent"),
            )
            .register::<MentionEvent>(
                CURRENT_SCHEMA_VERSION,
                format!("{topic_prefix}.message.mention"),
            )
            .register::<FriendAddedEvent>(
                CURRENT_SCHEMA_VERSION,
                format!("{topic_prefix}.friend.added"),
            );
        registry
    }

    /// Registers `E` at `version`, republished on `topic`.
    pub fn register<E: DomainEvent + Into<ChatEvent>>(
        &mut self,
        version: u32,
        topic: impl Into<String>,
    ) -> &mut Self {
        let descriptor = EventDescriptor {
            tag: E::EVENT_TYPE,
            version,
            topic: topic.into(),
            decode: decode_as::<E>,
        };
        self.entries
            .insert((E::EVENT_TYPE.to_string(), version), descriptor);
        self
    }

    /// Resolves an event type, fully-qualified or simple, at `version`.
    pub fn resolve(&self, event_type: &str, version: u32) -> Result<&EventDescriptor> {
        let tag = domain::simple_event_type(event_type);
        self.entries
            .get(&(tag.to_string(), version))
            .ok_or_else(|| RelayError::UnknownEventType {
                event_type: event_type.to_string(),
                version,
            })
    }

    /// Returns the number of registered entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
