// ABOUTME: Organic conversation starts from cron entries in config
// ABOUTME: When an entry fires, the persona opens the channel itself and hands the session off

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;

use crate::conductor::ConductorClient;
use crate::runtime::RuntimeHandle;
use troupe_core::config::{Config, ScheduleEntry};
use troupe_core::metrics;
use troupe_core::protocol::TurnRequest;
use troupe_core::session::StateStore;
use troupe_core::utils::preview;

/// How often due entries are checked
const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// A parsed schedule entry with its next firing time
struct OrganicStart {
    schedule: Schedule,
    timezone: Tz,
    entry: ScheduleEntry,
    next: Option<DateTime<Utc>>,
    fired: usize,
}

impl OrganicStart {
    fn compute_next(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.timezone))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Parse config entries, dropping the malformed ones with a warning so one
/// bad cron line can't keep the rest of the troupe from chatting
fn parse_entries(entries: &[ScheduleEntry], now: DateTime<Utc>) -> Vec<OrganicStart> {
    let mut starts = Vec::new();
    for entry in entries {
        let schedule = match Schedule::from_str(&entry.cron) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(cron = %entry.cron, error = %e, "Skipping invalid cron expression");
                continue;
            }
        };
        let timezone = match entry.timezone.parse::<Tz>() {
            Ok(tz) => tz,
            Err(e) => {
                tracing::warn!(timezone = %entry.timezone, error = %e, "Skipping invalid timezone");
                continue;
            }
        };
        let mut start = OrganicStart {
            schedule,
            timezone,
            entry: entry.clone(),
            next: None,
            fired: 0,
        };
        start.next = start.compute_next(now);
        starts.push(start);
    }
    starts
}

/// Run the organic-start loop until shutdown. Failures here are logged only:
/// nobody is waiting in the channel for a conversation that hasn't begun.
pub async fn run_scheduler(
    config: Arc<Config>,
    runtime: RuntimeHandle,
    conductor: ConductorClient,
    store: StateStore,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut starts = parse_entries(&config.schedule, Utc::now());
    if starts.is_empty() {
        tracing::info!("No organic conversation starts configured");
        return;
    }
    tracing::info!(count = starts.len(), "Organic conversation scheduler running");

    let mut ticker = interval(CHECK_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                tracing::info!("Scheduler stopping");
                return;
            }
        }

        let now = Utc::now();
        for start in &mut starts {
            let due = matches!(start.next, Some(next) if next <= now);
            if !due {
                continue;
            }
            fire(start, &config, &runtime, &conductor, &store).await;
            start.fired += 1;
            start.next = start.compute_next(now);
        }
    }
}

async fn fire(
    start: &OrganicStart,
    config: &Config,
    runtime: &RuntimeHandle,
    conductor: &ConductorClient,
    store: &StateStore,
) {
    let entry = &start.entry;
    // Rotate through the starter pool deterministically
    let starter = &entry.starters[start.fired % entry.starters.len()];
    let own_name = &config.persona.name;

    tracing::info!(
        channel_id = %entry.channel_id,
        starter_preview = %preview(starter, 50),
        "Opening organic conversation"
    );

    let session = match store.resolve_session(
        &entry.channel_id,
        own_name,
        config.state.session_ttl_secs,
    ) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, channel_id = %entry.channel_id,
                "State store unavailable for organic start — skipping this firing");
            metrics::record_organic_start("store_error");
            return;
        }
    };

    if let Err(e) = runtime.deliver(&entry.channel_id, starter).await {
        tracing::warn!(error = %e, channel_id = %entry.channel_id,
            "Organic starter delivery failed");
        metrics::record_organic_start("delivery_failed");
        return;
    }

    let own = config.persona.handle;
    let request = TurnRequest {
        user_query: starter.clone(),
        channel_id: entry.channel_id.clone(),
        initiator_persona: own_name.clone(),
        initiator_mention: (own != 0).then(|| format!("<@{}>", own)),
        human_display_name: String::new(),
        is_new_conversation: session.is_new,
        session_id: session.session_id.clone(),
        event_id: format!("organic:{}", uuid::Uuid::new_v4()),
    };

    match conductor.submit(&request).await {
        Ok(()) => metrics::record_organic_start("ok"),
        Err(e) => {
            // Logged only — no human is waiting on an unprompted start
            tracing::warn!(session_id = %session.session_id, error = %e,
                "Organic turn submission failed");
            metrics::record_organic_start("submit_failed");
        }
    }
}
