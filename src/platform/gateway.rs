// ABOUTME: WebSocket adapter to the chat platform's gateway
// ABOUTME: Identify/ready handshake, event frames in, seq-correlated send/resolve acks out

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

use troupe_core::traits::{
    ChannelInfo, ChatAuthor, DeliveryError, EventStream, InboundEvent, MessagingPlatform,
    PlatformConnectionState,
};

// =============================================================================
// Wire frames
// =============================================================================

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ClientFrame<'a> {
    Identify { token: &'a str },
    Send { seq: u64, channel_id: &'a str, text: &'a str },
    Resolve { seq: u64, channel_id: &'a str },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ServerFrame {
    Ready {
        bot: BotFrame,
        #[serde(default)]
        channels: Vec<ChannelFrame>,
    },
    Event {
        event_id: String,
        channel_id: String,
        author: AuthorFrame,
        body: String,
    },
    Ack {
        seq: u64,
        ok: bool,
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        detail: Option<String>,
    },
    Channel {
        seq: u64,
        #[serde(default)]
        channel: Option<ChannelFrame>,
    },
}

#[derive(Debug, Deserialize)]
struct BotFrame {
    handle: u64,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthorFrame {
    handle: u64,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    is_agent: bool,
}

#[derive(Debug, Deserialize)]
struct ChannelFrame {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

impl From<ChannelFrame> for ChannelInfo {
    fn from(frame: ChannelFrame) -> Self {
        ChannelInfo {
            id: frame.id,
            name: frame.name,
        }
    }
}

// =============================================================================
// Platform
// =============================================================================

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<ServerFrame>>>>;

/// The live gateway link. The runtime loop is the only caller of `send` /
/// `resolve_channel`; internally a reader task routes frames (events to the
/// stream, acks to their waiting callers) and a writer task owns the sink.
pub struct GatewayPlatform {
    bot_handle: u64,
    out_tx: mpsc::Sender<Message>,
    pending: PendingMap,
    channels: Arc<Mutex<HashMap<String, ChannelInfo>>>,
    state: Arc<Mutex<PlatformConnectionState>>,
    seq: AtomicU64,
    event_rx: Mutex<Option<mpsc::Receiver<InboundEvent>>>,
}

impl GatewayPlatform {
    /// Connect, identify, and wait for the ready frame. Returning from here
    /// means identity resolution is complete — callers may start serving.
    pub async fn connect(url: &str, token: &str) -> Result<Self> {
        let (ws, _) = connect_async(url)
            .await
            .context("Failed to connect to chat gateway")?;
        let (mut sink, mut stream) = ws.split();

        let identify = serde_json::to_string(&ClientFrame::Identify { token })?;
        sink.send(Message::Text(identify.into()))
            .await
            .context("Failed to send identify frame")?;

        // Handshake runs inline so nothing else observes a half-open link
        let (bot, initial_channels) = loop {
            let msg = stream
                .next()
                .await
                .ok_or_else(|| anyhow!("Gateway closed before ready"))?
                .context("Gateway handshake failed")?;
            match msg {
                Message::Text(text) => match serde_json::from_str::<ServerFrame>(text.as_str()) {
                    Ok(ServerFrame::Ready { bot, channels }) => break (bot, channels),
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::debug!(error = %e, "Ignoring unparseable handshake frame");
                    }
                },
                Message::Ping(payload) => {
                    sink.send(Message::Pong(payload)).await.ok();
                }
                Message::Close(_) => bail!("Gateway closed during handshake"),
                _ => {}
            }
        };

        tracing::info!(
            handle = bot.handle,
            name = bot.name.as_deref().unwrap_or("<unnamed>"),
            channels = initial_channels.len(),
            "Gateway ready"
        );

        let channels: Arc<Mutex<HashMap<String, ChannelInfo>>> = Arc::new(Mutex::new(
            initial_channels
                .into_iter()
                .map(|c| (c.id.clone(), c.into()))
                .collect(),
        ));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let state = Arc::new(Mutex::new(PlatformConnectionState::Connected));
        let (event_tx, event_rx) = mpsc::channel::<InboundEvent>(256);
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);

        // Writer: sole owner of the sink
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    tracing::error!(error = %e, "Gateway write failed — closing writer");
                    break;
                }
            }
        });

        // Reader: routes frames until the socket dies
        let reader_pending = Arc::clone(&pending);
        let reader_channels = Arc::clone(&channels);
        let reader_state = Arc::clone(&state);
        let pong_tx = out_tx.clone();
        tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerFrame>(text.as_str()) {
                            Ok(frame) => {
                                route_frame(
                                    frame,
                                    &event_tx,
                                    &reader_pending,
                                    &reader_channels,
                                )
                                .await
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, "Dropping unparseable gateway frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = pong_tx.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) => break "gateway sent close".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("read error: {}", e),
                    None => break "socket closed".to_string(),
                }
            };

            tracing::error!(reason = %reason, "Gateway connection lost");
            *reader_state.lock().unwrap_or_else(|p| p.into_inner()) =
                PlatformConnectionState::Disconnected {
                    reason: reason.clone(),
                };
            // Waiters get a dropped-sender error, which reads as transient
            reader_pending
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clear();
            // event_tx drops here; the runtime sees the stream end
        });

        Ok(Self {
            bot_handle: bot.handle,
            out_tx,
            pending,
            channels,
            state,
            seq: AtomicU64::new(1),
            event_rx: Mutex::new(Some(event_rx)),
        })
    }

    /// Send a correlated request frame and wait for its response frame
    async fn roundtrip(&self, frame: String, seq: u64) -> Option<ServerFrame> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(seq, tx);

        if self.out_tx.send(Message::Text(frame.into())).await.is_err() {
            self.pending
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&seq);
            return None;
        }
        rx.await.ok()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

async fn route_frame(
    frame: ServerFrame,
    event_tx: &mpsc::Sender<InboundEvent>,
    pending: &PendingMap,
    channels: &Arc<Mutex<HashMap<String, ChannelInfo>>>,
) {
    match frame {
        ServerFrame::Event {
            event_id,
            channel_id,
            author,
            body,
        } => {
            let event = InboundEvent {
                event_id,
                channel_id,
                author: ChatAuthor {
                    handle: author.handle,
                    display_name: author.display_name,
                    is_agent: author.is_agent,
                },
                body,
                received_at: chrono::Utc::now(),
            };
            if event_tx.send(event).await.is_err() {
                tracing::warn!("Runtime dropped the event stream — discarding event");
            }
        }
        ServerFrame::Ack { seq, .. } | ServerFrame::Channel { seq, .. } => {
            let waiter = pending
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&seq);
            match waiter {
                Some(tx) => {
                    // Keep the channel cache warm from resolve responses
                    if let ServerFrame::Channel {
                        channel: Some(ref c),
                        ..
                    } = frame
                    {
                        channels
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .insert(
                                c.id.clone(),
                                ChannelInfo {
                                    id: c.id.clone(),
                                    name: c.name.clone(),
                                },
                            );
                    }
                    let _ = tx.send(frame);
                }
                None => tracing::debug!(seq, "Response frame with no waiter"),
            }
        }
        ServerFrame::Ready { .. } => {
            tracing::debug!("Ignoring duplicate ready frame");
        }
    }
}

#[async_trait]
impl MessagingPlatform for GatewayPlatform {
    async fn event_stream(&self) -> Result<EventStream> {
        let rx = match self.event_rx.lock().unwrap_or_else(|p| p.into_inner()).take() {
            Some(rx) => rx,
            None => bail!("Event stream already taken"),
        };
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn send(&self, channel_id: &str, text: &str) -> Result<(), DeliveryError> {
        let seq = self.next_seq();
        let frame = serde_json::to_string(&ClientFrame::Send {
            seq,
            channel_id,
            text,
        })
        .map_err(|e| DeliveryError::Transient(e.to_string()))?;

        match self.roundtrip(frame, seq).await {
            Some(ServerFrame::Ack { ok: true, .. }) => Ok(()),
            Some(ServerFrame::Ack {
                ok: false,
                code,
                detail,
                ..
            }) => {
                let detail = detail.unwrap_or_else(|| "gateway refused delivery".to_string());
                match code.as_deref() {
                    Some("permission_denied") => Err(DeliveryError::PermissionDenied(detail)),
                    Some("not_found") => {
                        // Our cached view was stale; forget it so the next
                        // resolve is a real fetch
                        self.channels
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .remove(channel_id);
                        Err(DeliveryError::ChannelNotFound(detail))
                    }
                    _ => Err(DeliveryError::Transient(detail)),
                }
            }
            Some(_) | None => Err(DeliveryError::Transient(
                "gateway connection dropped mid-delivery".to_string(),
            )),
        }
    }

    async fn resolve_channel(&self, channel_id: &str) -> Result<Option<ChannelInfo>> {
        if let Some(info) = self
            .channels
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(channel_id)
            .cloned()
        {
            return Ok(Some(info));
        }

        // Cache miss: ask the gateway
        let seq = self.next_seq();
        let frame = serde_json::to_string(&ClientFrame::Resolve { seq, channel_id })?;
        match self.roundtrip(frame, seq).await {
            Some(ServerFrame::Channel { channel, .. }) => Ok(channel.map(Into::into)),
            Some(_) | None => bail!("gateway connection dropped during channel resolution"),
        }
    }

    fn bot_handle(&self) -> u64 {
        self.bot_handle
    }

    fn platform_id(&self) -> &'static str {
        "gateway"
    }

    fn connection_state(&self) -> PlatformConnectionState {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    async fn shutdown(&self) -> Result<()> {
        let _ = self.out_tx.send(Message::Close(None)).await;
        Ok(())
    }
}
