// ABOUTME: End-to-end tests for the agent runtime bridge
// ABOUTME: Mock platform in, fake conductor transport out; asserts election and fallback behavior

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

use troupe::conductor::{ConductorClient, SubmitError, TurnTransport};
use troupe::config::Config;
use troupe::platform::MockPlatform;
use troupe::protocol::{TurnAck, TurnRequest};
use troupe::runtime::{AgentRuntime, RuntimeHandle};
use troupe::session::StateStore;
use troupe::traits::{ChatAuthor, InboundEvent, MessagingPlatform};

// =============================================================================
// Test fixtures
// =============================================================================

/// Records every submitted turn; optionally fails all attempts
struct RecordingTransport {
    requests: Arc<Mutex<Vec<TurnRequest>>>,
    fail_always: bool,
    calls: AtomicU32,
}

impl RecordingTransport {
    fn accepting() -> Arc<Self> {
        Arc::new(Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            fail_always: false,
            calls: AtomicU32::new(0),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            fail_always: true,
            calls: AtomicU32::new(0),
        })
    }

    fn requests(&self) -> Vec<TurnRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl TurnTransport for RecordingTransport {
    async fn post_turn(&self, request: &TurnRequest) -> Result<TurnAck, SubmitError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_always {
            return Err(SubmitError::Timeout);
        }
        self.requests.lock().unwrap().push(request.clone());
        Ok(TurnAck { accepted: true })
    }
}

fn test_config(dir: &TempDir) -> Arc<Config> {
    let raw = format!(
        r#"
        [persona]
        name = "peter"
        handle = 111
        display_name = "Peter"
        apology_lines = ["Ah jeez, my brain just froze. Try me again?"]

        [[roster]]
        name = "peter"
        handle = 111

        [[roster]]
        name = "brian"
        handle = 222

        [platform]
        kind = "mock"

        [conductor]
        url = "http://127.0.0.1:9000"
        timeout_secs = 5
        max_attempts = 3
        retry_delay_ms = 100

        [state]
        path = "{}"
        "#,
        dir.path().join("state.db").display()
    );
    Arc::new(toml::from_str(&raw).unwrap())
}

struct Harness {
    platform: Arc<MockPlatform>,
    transport: Arc<RecordingTransport>,
    handle: RuntimeHandle,
    _shutdown_tx: watch::Sender<bool>,
    _dir: TempDir,
}

fn start(transport: Arc<RecordingTransport>) -> Harness {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let platform = Arc::new(MockPlatform::new(111));
    platform.add_channel("C1", "lounge");

    let store = StateStore::open(dir.path().join("state.db")).unwrap();
    let identities = Arc::new(config.identity_table().unwrap());
    let policy = config.conductor.retry_policy();
    let conductor = ConductorClient::new(transport.clone(), policy);

    let runtime = AgentRuntime::new(
        platform.clone() as Arc<dyn MessagingPlatform>,
        identities,
        store,
        conductor,
        config,
    );
    let handle = runtime.handle();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(runtime.run(shutdown_rx));

    Harness {
        platform,
        transport,
        handle,
        _shutdown_tx: shutdown_tx,
        _dir: dir,
    }
}

fn human_event(id: &str, body: &str) -> InboundEvent {
    InboundEvent {
        event_id: id.to_string(),
        channel_id: "C1".to_string(),
        author: ChatAuthor::human(9, "Lois"),
        body: body.to_string(),
        received_at: Utc::now(),
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

// =============================================================================
// Election and submission
// =============================================================================

#[tokio::test]
async fn human_prefix_event_submits_one_turn() {
    let h = start(RecordingTransport::accepting());

    h.platform.inject(human_event("evt-1", "!peter hello")).await;
    wait_until(|| h.transport.requests().len() == 1).await;

    let requests = h.transport.requests();
    let turn = &requests[0];
    assert_eq!(turn.user_query, "hello");
    assert_eq!(turn.channel_id, "C1");
    assert_eq!(turn.initiator_persona, "peter");
    assert_eq!(turn.initiator_mention.as_deref(), Some("<@111>"));
    assert_eq!(turn.human_display_name, "Lois");
    assert_eq!(turn.event_id, "evt-1");
    assert!(turn.is_new_conversation);

    // Acceptance is the end of the local flow: nothing is sent to the
    // channel until the conductor calls back
    assert!(h.platform.sent_messages().is_empty());
}

#[tokio::test]
async fn own_and_unaddressed_events_are_ignored() {
    let h = start(RecordingTransport::accepting());

    // Our own outbound event, an unaddressed line, and someone else's prefix
    h.platform
        .inject(InboundEvent {
            event_id: "evt-self".to_string(),
            channel_id: "C1".to_string(),
            author: ChatAuthor::agent(111, "Peter"),
            body: "!peter talking to myself <@111>".to_string(),
            received_at: Utc::now(),
        })
        .await;
    h.platform.inject(human_event("evt-2", "nice weather")).await;
    h.platform.inject(human_event("evt-3", "!brian hello")).await;
    // A marker event that *is* for us, to prove the others were processed
    h.platform.inject(human_event("evt-4", "!peter marker")).await;

    wait_until(|| h.transport.requests().len() == 1).await;
    assert_eq!(h.transport.requests()[0].user_query, "marker");
}

#[tokio::test]
async fn relay_mention_from_sibling_submits_a_turn() {
    let h = start(RecordingTransport::accepting());

    h.platform
        .inject(InboundEvent {
            event_id: "evt-relay".to_string(),
            channel_id: "C1".to_string(),
            author: ChatAuthor::agent(222, "Brian"),
            body: "<@111> what do you make of that?".to_string(),
            received_at: Utc::now(),
        })
        .await;

    wait_until(|| h.transport.requests().len() == 1).await;
    let requests = h.transport.requests();
    assert_eq!(requests[0].user_query, "what do you make of that?");
    assert_eq!(requests[0].initiator_persona, "peter");
}

#[tokio::test]
async fn session_id_is_stable_within_a_conversation() {
    let h = start(RecordingTransport::accepting());

    h.platform.inject(human_event("evt-1", "!peter first")).await;
    wait_until(|| h.transport.requests().len() == 1).await;
    h.platform.inject(human_event("evt-2", "!peter second")).await;
    wait_until(|| h.transport.requests().len() == 2).await;

    let requests = h.transport.requests();
    assert_eq!(requests[0].session_id, requests[1].session_id);
    assert!(requests[0].is_new_conversation);
    assert!(!requests[1].is_new_conversation);
}

#[tokio::test]
async fn replayed_event_is_submitted_once() {
    let h = start(RecordingTransport::accepting());

    let event = human_event("evt-replay", "!peter hello again");
    h.platform.inject(event.clone()).await;
    h.platform.inject(event.clone()).await;
    h.platform.inject(human_event("evt-after", "!peter done")).await;

    wait_until(|| h.transport.requests().len() == 2).await;
    let requests = h.transport.requests();
    assert_eq!(requests[0].event_id, "evt-replay");
    assert_eq!(requests[1].event_id, "evt-after");
}

// =============================================================================
// Failure fallback
// =============================================================================

#[tokio::test(start_paused = true)]
async fn exhausted_submission_delivers_exactly_one_apology() {
    let h = start(RecordingTransport::failing());

    h.platform.inject(human_event("evt-1", "!peter hello?")).await;

    wait_until(|| !h.platform.sent_messages().is_empty()).await;
    // Let any stray retry or duplicate fallback surface before asserting
    tokio::time::sleep(Duration::from_secs(2)).await;

    let sent = h.platform.sent_messages();
    assert_eq!(sent.len(), 1, "exactly one fallback message: {:?}", sent);
    assert_eq!(sent[0].0, "C1");
    assert_eq!(sent[0].1, "Ah jeez, my brain just froze. Try me again?");

    // All three attempts were spent before degrading
    assert_eq!(h.transport.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn deliveries_go_through_the_runtime_handle() {
    let h = start(RecordingTransport::accepting());

    h.handle.deliver("C1", "conductor says hi").await.unwrap();
    assert_eq!(
        h.platform.sent_messages(),
        vec![("C1".to_string(), "conductor says hi".to_string())]
    );
}

#[tokio::test]
async fn delivery_to_unknown_channel_is_classified_not_found() {
    let h = start(RecordingTransport::accepting());

    let err = h.handle.deliver("C404", "hello?").await.unwrap_err();
    assert!(matches!(
        err,
        troupe::traits::DeliveryError::ChannelNotFound(_)
    ));
    assert!(h.platform.sent_messages().is_empty());
}

#[tokio::test]
async fn connection_state_reports_through_the_bridge() {
    let h = start(RecordingTransport::accepting());
    let state = h.handle.connection_state().await;
    assert!(state.is_connected());
}
