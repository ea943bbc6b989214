// ABOUTME: The agent's concurrency bridge: one loop owns the platform connection,
// ABOUTME: everything else marshals platform work through a command channel

use anyhow::{bail, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::StreamExt;

use crate::conductor::ConductorClient;
use troupe_core::config::Config;
use troupe_core::identity::IdentityTable;
use troupe_core::metrics;
use troupe_core::protocol::TurnRequest;
use troupe_core::resolver::{classify, Disposition};
use troupe_core::session::StateStore;
use troupe_core::traits::{
    ChannelInfo, DeliveryError, InboundEvent, MessagingPlatform, PlatformConnectionState,
};
use troupe_core::utils::{chunk_message, preview, MAX_CHUNK_SIZE};

/// Work marshaled onto the platform loop from other execution contexts.
/// Each command carries a oneshot responder so the caller can await the
/// outcome without ever touching the connection itself.
pub enum PlatformCommand {
    Deliver {
        channel_id: String,
        text: String,
        respond: oneshot::Sender<Result<(), DeliveryError>>,
    },
    ResolveChannel {
        channel_id: String,
        respond: oneshot::Sender<Result<Option<ChannelInfo>>>,
    },
    ConnectionState {
        respond: oneshot::Sender<PlatformConnectionState>,
    },
}

/// Cloneable handle for submitting commands to the runtime loop. Held by the
/// control surface, the scheduler, and spawned submission tasks.
#[derive(Clone)]
pub struct RuntimeHandle {
    tx: mpsc::Sender<PlatformCommand>,
}

impl RuntimeHandle {
    /// Deliver text into a channel via the platform loop
    pub async fn deliver(&self, channel_id: &str, text: &str) -> Result<(), DeliveryError> {
        let (respond, rx) = oneshot::channel();
        self.tx
            .send(PlatformCommand::Deliver {
                channel_id: channel_id.to_string(),
                text: text.to_string(),
                respond,
            })
            .await
            .map_err(|_| DeliveryError::Transient("agent runtime is shutting down".into()))?;
        rx.await
            .map_err(|_| DeliveryError::Transient("runtime dropped the delivery".into()))?
    }

    pub async fn resolve_channel(&self, channel_id: &str) -> Result<Option<ChannelInfo>> {
        let (respond, rx) = oneshot::channel();
        self.tx
            .send(PlatformCommand::ResolveChannel {
                channel_id: channel_id.to_string(),
                respond,
            })
            .await
            .map_err(|_| anyhow::anyhow!("agent runtime is shutting down"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("runtime dropped the resolution"))?
    }

    pub async fn connection_state(&self) -> PlatformConnectionState {
        let (respond, rx) = oneshot::channel();
        if self
            .tx
            .send(PlatformCommand::ConnectionState { respond })
            .await
            .is_err()
        {
            return PlatformConnectionState::Disconnected {
                reason: "runtime unavailable".to_string(),
            };
        }
        rx.await.unwrap_or(PlatformConnectionState::Disconnected {
            reason: "runtime unavailable".to_string(),
        })
    }
}

/// Owns the platform connection and runs both halves of the bridge: inbound
/// event dispatch (classify, elect, submit) and marshaled platform commands
/// from the control surface and scheduler.
pub struct AgentRuntime {
    platform: Arc<dyn MessagingPlatform>,
    identities: Arc<IdentityTable>,
    store: StateStore,
    conductor: ConductorClient,
    config: Arc<Config>,
    cmd_tx: mpsc::Sender<PlatformCommand>,
    cmd_rx: mpsc::Receiver<PlatformCommand>,
}

impl AgentRuntime {
    pub fn new(
        platform: Arc<dyn MessagingPlatform>,
        identities: Arc<IdentityTable>,
        store: StateStore,
        conductor: ConductorClient,
        config: Arc<Config>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        Self {
            platform,
            identities,
            store,
            conductor,
            config,
            cmd_tx,
            cmd_rx,
        }
    }

    pub fn handle(&self) -> RuntimeHandle {
        RuntimeHandle {
            tx: self.cmd_tx.clone(),
        }
    }

    /// Run until the platform stream ends or shutdown is signaled. The loop
    /// is the sole caller of platform methods; a failure dispatching one
    /// event is logged and never tears the loop down.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut events = self.platform.event_stream().await?;
        metrics::set_platform_connected(true);
        tracing::info!(
            persona = %self.identities.own().name,
            platform = self.platform.platform_id(),
            "Agent runtime started"
        );

        loop {
            tokio::select! {
                maybe_event = events.next() => match maybe_event {
                    Some(event) => self.dispatch_event(event).await,
                    None => {
                        metrics::set_platform_connected(false);
                        bail!("Platform event stream ended — restarting the process is required");
                    }
                },
                Some(cmd) = self.cmd_rx.recv() => self.handle_command(cmd).await,
                _ = shutdown.changed() => {
                    tracing::info!("Shutdown signal received — draining platform connection");
                    if let Err(e) = self.platform.shutdown().await {
                        tracing::warn!(error = %e, "Platform shutdown reported an error");
                    }
                    metrics::set_platform_connected(false);
                    return Ok(());
                }
            }
        }
    }

    // =========================================================================
    // Inbound dispatch
    // =========================================================================

    async fn dispatch_event(&self, event: InboundEvent) {
        let disposition = classify(&event, &self.identities);

        let (text, human_visible) = match disposition {
            Disposition::Ignore => {
                metrics::record_event_classified("ignored");
                return;
            }
            Disposition::HumanDirect { text } => {
                metrics::record_event_classified("human_direct");
                (text, true)
            }
            Disposition::AgentRelay { text } => {
                metrics::record_event_classified("agent_relay");
                (text, true)
            }
        };

        // Best-effort replay suppression (platform reconnects re-deliver
        // recent events). A store failure means we process the event anyway.
        let persona = &self.config.persona;
        match self
            .store
            .mark_event_seen(&persona.name, &event.event_id, self.config.state.seen_ttl_secs)
        {
            Ok(true) => {}
            Ok(false) => {
                metrics::record_event_classified("duplicate");
                tracing::debug!(event_id = %event.event_id, "Skipping already-seen event");
                return;
            }
            Err(e) => {
                tracing::debug!(error = %e, "De-dup marker unavailable — continuing");
            }
        }

        tracing::info!(
            event_id = %event.event_id,
            channel_id = %event.channel_id,
            author = event.author.handle,
            body_preview = %preview(&text, 50),
            "Elected to initiate a turn"
        );

        self.start_turn(event, text, human_visible);
    }

    /// Hand the turn to the conductor off the loop's critical path. A slow or
    /// failing conductor never blocks event processing.
    fn start_turn(&self, event: InboundEvent, text: String, human_visible: bool) {
        let own = self.identities.own();

        let session = match self.store.resolve_session(
            &event.channel_id,
            &own.name,
            self.config.state.session_ttl_secs,
        ) {
            Ok(s) => s,
            Err(e) => {
                // Sessions are soft state; mint a fresh one rather than drop
                // the human's turn on a store hiccup
                tracing::warn!(error = %e, channel_id = %event.channel_id,
                    "State store unavailable — minting detached session");
                troupe_core::session::ConversationSession {
                    session_id: uuid::Uuid::new_v4().to_string(),
                    channel_id: event.channel_id.clone(),
                    initiator_persona: own.name.clone(),
                    started_at: chrono::Utc::now().to_rfc3339(),
                    is_new: true,
                }
            }
        };

        let request = TurnRequest {
            user_query: text,
            channel_id: event.channel_id.clone(),
            initiator_persona: own.name.clone(),
            initiator_mention: own.mention(),
            human_display_name: event.author.display_name.clone().unwrap_or_default(),
            is_new_conversation: session.is_new,
            session_id: session.session_id,
            event_id: event.event_id.clone(),
        };

        let conductor = self.conductor.clone();
        let handle = self.handle();
        let apology = self.config.persona.apology_for(&event.event_id);
        let channel_id = event.channel_id;
        let event_id = event.event_id;

        tokio::spawn(async move {
            if let Err(e) = conductor.submit(&request).await {
                if !human_visible {
                    tracing::warn!(event_id = %event_id, error = %e,
                        "Organic turn submission failed — no user-facing fallback");
                    return;
                }
                // The human is waiting: degrade to a persona-voiced notice
                // rather than silence. Exactly one message either way.
                tracing::warn!(event_id = %event_id, error = %e,
                    "Turn submission failed — delivering fallback notice");
                if let Err(send_err) = handle.deliver(&channel_id, &apology).await {
                    tracing::error!(
                        event_id = %event_id,
                        channel_id = %channel_id,
                        error = %send_err,
                        "Failed to deliver fallback notice"
                    );
                }
            }
        });
    }

    // =========================================================================
    // Marshaled platform commands
    // =========================================================================

    async fn handle_command(&self, cmd: PlatformCommand) {
        match cmd {
            PlatformCommand::Deliver {
                channel_id,
                text,
                respond,
            } => {
                let result = self.deliver_validated(&channel_id, &text).await;
                match &result {
                    Ok(()) => {
                        metrics::record_delivery("delivered");
                        if let Err(e) = self.store.record_reply_fingerprint(
                            &self.config.persona.name,
                            &channel_id,
                            &text,
                            self.config.state.fingerprint_ttl_secs,
                        ) {
                            tracing::debug!(error = %e, "Failed to record reply fingerprint");
                        }
                    }
                    Err(DeliveryError::PermissionDenied(detail)) => {
                        metrics::record_delivery("permission_denied");
                        tracing::error!(
                            channel_id = %channel_id,
                            persona = %self.config.persona.name,
                            detail = %detail,
                            "Delivery refused: permission denied"
                        );
                    }
                    Err(DeliveryError::ChannelNotFound(detail)) => {
                        metrics::record_delivery("not_found");
                        tracing::error!(
                            channel_id = %channel_id,
                            persona = %self.config.persona.name,
                            detail = %detail,
                            "Delivery refused: channel not found"
                        );
                    }
                    Err(DeliveryError::Transient(detail)) => {
                        metrics::record_delivery("transient");
                        tracing::warn!(
                            channel_id = %channel_id,
                            detail = %detail,
                            "Delivery failed transiently"
                        );
                    }
                }
                let _ = respond.send(result);
            }
            PlatformCommand::ResolveChannel {
                channel_id,
                respond,
            } => {
                let _ = respond.send(self.platform.resolve_channel(&channel_id).await);
            }
            PlatformCommand::ConnectionState { respond } => {
                let state = self.platform.connection_state();
                metrics::set_platform_connected(state.is_connected());
                let _ = respond.send(state);
            }
        }
    }

    /// Validate the target channel resolves before sending, and give a stale
    /// channel reference exactly one re-resolution before calling it gone.
    async fn deliver_validated(&self, channel_id: &str, text: &str) -> Result<(), DeliveryError> {
        match self.platform.resolve_channel(channel_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return Err(DeliveryError::ChannelNotFound(format!(
                    "channel {} is unknown to the platform",
                    channel_id
                )))
            }
            Err(e) => return Err(DeliveryError::Transient(e.to_string())),
        }

        for chunk in chunk_message(text, MAX_CHUNK_SIZE) {
            match self.platform.send(channel_id, &chunk).await {
                Ok(()) => {}
                Err(DeliveryError::ChannelNotFound(detail)) => {
                    // The local cache was stale; re-resolve once and retry
                    match self.platform.resolve_channel(channel_id).await {
                        Ok(Some(_)) => self.platform.send(channel_id, &chunk).await?,
                        _ => return Err(DeliveryError::ChannelNotFound(detail)),
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
