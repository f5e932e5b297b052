//! Trigger registry: pluggable predicates that decide whether a message
//! should wake the agent.
//!
//! Triggers are evaluated in descending priority order (ties keep insertion
//! order) and evaluation stops at the first match.

use std::sync::Arc;

use convoy_protocol::{BotIdentity, ChatMessage};

use crate::config::TriggersConfig;

/// Default priority of [`MentionTrigger`].
pub const MENTION_PRIORITY: i32 = 100;
/// Default priority of [`DirectMessageTrigger`].
pub const DIRECT_MESSAGE_PRIORITY: i32 = 50;
/// Default priority of [`KeywordTrigger`].
pub const KEYWORD_PRIORITY: i32 = 10;

// ============================================================================
// Public types
// ============================================================================

/// Per-message evaluation context.
#[derive(Debug, Clone, Copy)]
pub struct TriggerContext<'a> {
    /// The bot's identity, if the identity probe succeeded.
    pub identity: Option<&'a BotIdentity>,
    /// Untouched platform payload for the message.
    pub raw: &'a serde_json::Value,
}

/// A predicate that can wake the agent.
pub trait Trigger: Send + Sync {
    fn id(&self) -> &str;

    fn priority(&self) -> i32;

    fn check(&self, message: &ChatMessage, ctx: &TriggerContext<'_>) -> bool;

    /// Optional metadata reported alongside a match.
    fn metadata(&self) -> Option<serde_json::Value> {
        None
    }
}

/// The first trigger that matched a message.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerMatch {
    pub trigger_id: String,
    pub priority: i32,
    pub metadata: Option<serde_json::Value>,
}

// ============================================================================
// TriggerRegistry
// ============================================================================

#[derive(Default)]
pub struct TriggerRegistry {
    triggers: Vec<Arc<dyn Trigger>>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry described by config.
    pub fn from_config(config: &TriggersConfig) -> Self {
        let mut registry = Self::new();
        if config.mention {
            registry.register(Arc::new(MentionTrigger));
        }
        if config.direct_messages {
            registry.register(Arc::new(DirectMessageTrigger));
        }
        if !config.keywords.is_empty() {
            registry.register(Arc::new(KeywordTrigger::new(config.keywords.clone())));
        }
        registry
    }

    /// Insert a trigger, keeping descending priority order. Equal priorities
    /// keep insertion order. A trigger with an existing id replaces it.
    pub fn register(&mut self, trigger: Arc<dyn Trigger>) {
        self.unregister(trigger.id());
        let position = self
            .triggers
            .iter()
            .position(|t| t.priority() < trigger.priority())
            .unwrap_or(self.triggers.len());
        self.triggers.insert(position, trigger);
    }

    /// Remove a trigger by id. Returns whether anything was removed.
    pub fn unregister(&mut self, id: &str) -> bool {
        let before = self.triggers.len();
        self.triggers.retain(|t| t.id() != id);
        self.triggers.len() != before
    }

    pub fn evaluate(&self, message: &ChatMessage, ctx: &TriggerContext<'_>) -> Option<TriggerMatch> {
        self.triggers
            .iter()
            .find(|t| t.check(message, ctx))
            .map(|t| TriggerMatch {
                trigger_id: t.id().to_string(),
                priority: t.priority(),
                metadata: t.metadata(),
            })
    }

    pub fn ids(&self) -> Vec<String> {
        self.triggers.iter().map(|t| t.id().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }
}

// ============================================================================
// Built-in triggers
// ============================================================================

/// Matches when the bot itself is @mentioned.
///
/// Without a resolved identity every mention is ambiguous and counts as a
/// mention of the bot.
pub struct MentionTrigger;

impl Trigger for MentionTrigger {
    fn id(&self) -> &str {
        "mention"
    }

    fn priority(&self) -> i32 {
        MENTION_PRIORITY
    }

    fn check(&self, message: &ChatMessage, ctx: &TriggerContext<'_>) -> bool {
        match ctx.identity {
            Some(identity) => message.mentions.iter().any(|m| m.id == identity.id),
            None => !message.mentions.is_empty(),
        }
    }
}

/// Matches every message in a 1:1 conversation.
pub struct DirectMessageTrigger;

impl Trigger for DirectMessageTrigger {
    fn id(&self) -> &str {
        "direct-message"
    }

    fn priority(&self) -> i32 {
        DIRECT_MESSAGE_PRIORITY
    }

    fn check(&self, message: &ChatMessage, _ctx: &TriggerContext<'_>) -> bool {
        message.is_direct()
    }
}

/// Case-insensitive substring match against a keyword list.
pub struct KeywordTrigger {
    keywords: Vec<String>,
}

impl KeywordTrigger {
    pub fn new(keywords: Vec<String>) -> Self {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }
}

impl Trigger for KeywordTrigger {
    fn id(&self) -> &str {
        "keyword"
    }

    fn priority(&self) -> i32 {
        KEYWORD_PRIORITY
    }

    fn check(&self, message: &ChatMessage, _ctx: &TriggerContext<'_>) -> bool {
        let text = message.text.to_lowercase();
        self.keywords.iter().any(|k| text.contains(k.as_str()))
    }

    fn metadata(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({ "keywords": self.keywords }))
    }
}

// ============================================================================
// Tests
// ============================================================================
