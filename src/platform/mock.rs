// ABOUTME: In-memory platform for tests and local development
// ABOUTME: Scripted inbound events, recorded outbound sends, per-channel failure injection

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use troupe_core::traits::{
    ChannelInfo, DeliveryError, EventStream, InboundEvent, MessagingPlatform,
    PlatformConnectionState,
};

/// A platform that never leaves the process. Channels are registered up
/// front, inbound events are injected by the test (or left empty for local
/// dev), and every outbound send is recorded for assertions.
pub struct MockPlatform {
    bot_handle: u64,
    channels: Arc<Mutex<HashMap<String, ChannelInfo>>>,
    denied: Arc<Mutex<HashSet<String>>>,
    sent: Arc<Mutex<Vec<(String, String)>>>,
    event_tx: mpsc::Sender<InboundEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<InboundEvent>>>,
}

impl MockPlatform {
    pub fn new(bot_handle: u64) -> Self {
        let (event_tx, event_rx) = mpsc::channel(64);
        Self {
            bot_handle,
            channels: Arc::new(Mutex::new(HashMap::new())),
            denied: Arc::new(Mutex::new(HashSet::new())),
            sent: Arc::new(Mutex::new(Vec::new())),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    /// Register a channel the platform knows about
    pub fn add_channel(&self, id: &str, name: &str) {
        self.channels.lock().unwrap_or_else(|p| p.into_inner()).insert(
            id.to_string(),
            ChannelInfo {
                id: id.to_string(),
                name: Some(name.to_string()),
            },
        );
    }

    /// Make deliveries to a channel fail with permission-denied
    pub fn deny_channel(&self, id: &str) {
        self.denied.lock().unwrap_or_else(|p| p.into_inner()).insert(id.to_string());
    }

    /// Inject an inbound event as if the platform had delivered it
    pub async fn inject(&self, event: InboundEvent) {
        let _ = self.event_tx.send(event).await;
    }

    /// Everything sent so far, as (channel_id, text) pairs
    pub fn sent_messages(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl MessagingPlatform for MockPlatform {
    async fn event_stream(&self) -> Result<EventStream> {
        let rx = match self.event_rx.lock().unwrap_or_else(|p| p.into_inner()).take() {
            Some(rx) => rx,
            None => bail!("Event stream already taken"),
        };
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn send(&self, channel_id: &str, text: &str) -> Result<(), DeliveryError> {
        if self.denied.lock().unwrap_or_else(|p| p.into_inner()).contains(channel_id) {
            return Err(DeliveryError::PermissionDenied(format!(
                "not a member of {}",
                channel_id
            )));
        }
        if !self.channels.lock().unwrap_or_else(|p| p.into_inner()).contains_key(channel_id) {
            return Err(DeliveryError::ChannelNotFound(channel_id.to_string()));
        }
        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((channel_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn resolve_channel(&self, channel_id: &str) -> Result<Option<ChannelInfo>> {
        Ok(self.channels.lock().unwrap_or_else(|p| p.into_inner()).get(channel_id).cloned())
    }

    fn bot_handle(&self) -> u64 {
        self.bot_handle
    }

    fn platform_id(&self) -> &'static str {
        "mock"
    }

    fn connection_state(&self) -> PlatformConnectionState {
        PlatformConnectionState::Connected
    }
}
