// ABOUTME: Core platform abstraction: inbound events, delivery errors, connection state
// ABOUTME: The MessagingPlatform trait is the only seam between agents and the chat transport

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::pin::Pin;
use tokio_stream::Stream;

// =============================================================================
// Inbound Events
// =============================================================================

/// The author of an inbound platform event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatAuthor {
    /// Platform-assigned numeric handle
    pub handle: u64,
    /// Display name, if the platform supplied one
    pub display_name: Option<String>,
    /// True when the author is one of the troupe's agents (platform bot flag)
    pub is_agent: bool,
}

impl ChatAuthor {
    pub fn human(handle: u64, display_name: impl Into<String>) -> Self {
        Self {
            handle,
            display_name: Some(display_name.into()),
            is_agent: false,
        }
    }

    pub fn agent(handle: u64, display_name: impl Into<String>) -> Self {
        Self {
            handle,
            display_name: Some(display_name.into()),
            is_agent: true,
        }
    }
}

/// A message event observed on the platform connection. Ephemeral — never
/// persisted; derived values (own-authorship, mentions) are computed by the
/// resolver at classification time.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    /// Platform-unique event identifier; doubles as the idempotency key for
    /// turn submission
    pub event_id: String,
    pub channel_id: String,
    pub author: ChatAuthor,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

/// Boxed stream of platform events
pub type EventStream = Pin<Box<dyn Stream<Item = InboundEvent> + Send>>;

// =============================================================================
// Channels and Delivery
// =============================================================================

/// Channel metadata as known to the platform connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: String,
    pub name: Option<String>,
}

/// Classified delivery failure. Callers treat each variant differently:
/// permission and not-found are permanent, transient may be worth a caller
/// retry, and none of them are retried by the platform itself.
#[derive(Debug, Clone)]
pub enum DeliveryError {
    PermissionDenied(String),
    ChannelNotFound(String),
    Transient(String),
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PermissionDenied(detail) => write!(f, "permission denied: {}", detail),
            Self::ChannelNotFound(detail) => write!(f, "channel not found: {}", detail),
            Self::Transient(detail) => write!(f, "transient delivery failure: {}", detail),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Connection state reported by the platform for health checks
#[derive(Debug, Clone)]
pub enum PlatformConnectionState {
    Connected,
    Connecting,
    Disconnected { reason: String },
}

impl PlatformConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

// =============================================================================
// Platform Trait
// =============================================================================

/// The chat platform connection owned by one agent process.
///
/// Implementations hold the single live connection; the runtime's event loop
/// is the only caller. Anything else that needs the platform (the control
/// surface, the scheduler) marshals work onto that loop instead of calling
/// these methods directly.
#[async_trait]
pub trait MessagingPlatform: Send + Sync {
    /// Take the inbound event stream. May be taken once per connection.
    async fn event_stream(&self) -> Result<EventStream>;

    /// Deliver text into a channel on this connection.
    async fn send(&self, channel_id: &str, text: &str) -> Result<(), DeliveryError>;

    /// Look up channel metadata, fetching from the platform on a local cache
    /// miss. `Ok(None)` means the platform itself does not know the channel.
    async fn resolve_channel(&self, channel_id: &str) -> Result<Option<ChannelInfo>>;

    /// This agent's platform handle
    fn bot_handle(&self) -> u64;

    /// Platform identifier (e.g., "gateway", "mock")
    fn platform_id(&self) -> &'static str;

    /// Current connection state for health reporting
    fn connection_state(&self) -> PlatformConnectionState;

    /// Check whether a handle is this agent itself
    fn is_self(&self, handle: u64) -> bool {
        handle == self.bot_handle()
    }

    /// Gracefully close the connection
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_author_constructors() {
        let human = ChatAuthor::human(42, "Lois");
        assert!(!human.is_agent);
        assert_eq!(human.display_name.as_deref(), Some("Lois"));

        let agent = ChatAuthor::agent(7, "Peter");
        assert!(agent.is_agent);
        assert_eq!(agent.handle, 7);
    }

    #[test]
    fn test_delivery_error_display() {
        let err = DeliveryError::PermissionDenied("channel C9".into());
        assert!(err.to_string().contains("permission denied"));

        let err = DeliveryError::ChannelNotFound("C404".into());
        assert!(err.to_string().contains("not found"));

        let err = DeliveryError::Transient("socket closed".into());
        assert!(err.to_string().contains("transient"));
    }

    #[test]
    fn test_connection_state_is_connected() {
        assert!(PlatformConnectionState::Connected.is_connected());
        assert!(!PlatformConnectionState::Connecting.is_connected());
        assert!(!PlatformConnectionState::Disconnected {
            reason: "gone".into()
        }
        .is_connected());
    }
}
