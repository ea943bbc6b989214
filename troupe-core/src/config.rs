// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Missing mandatory fields are fatal at startup; secrets are redacted from Debug

use crate::identity::{IdentityTable, PersonaIdentity};
use crate::retry::RetryPolicy;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub persona: PersonaConfig,
    /// Every persona in the troupe, this one included. All agents load the
    /// same roster so inter-agent mentions resolve identically everywhere.
    #[serde(default)]
    pub roster: Vec<RosterEntry>,
    pub platform: PlatformConfig,
    pub conductor: ConductorConfig,
    #[serde(default)]
    pub control: ControlConfig,
    pub state: StateConfig,
    #[serde(default)]
    pub schedule: Vec<ScheduleEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    pub name: String,
    pub handle: u64,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Persona-voiced fallback lines used when the conductor is unreachable.
    /// Chosen deterministically per event so retries repeat the same line.
    #[serde(default)]
    pub apology_lines: Vec<String>,
}

impl PersonaConfig {
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    /// Pick an apology line keyed on the triggering event id
    pub fn apology_for(&self, event_id: &str) -> String {
        if self.apology_lines.is_empty() {
            return format!(
                "({} shakes their head) Sorry — I lost my train of thought. Give me a moment and try again?",
                self.display_name()
            );
        }
        let index = event_id.bytes().map(|b| b as usize).sum::<usize>() % self.apology_lines.len();
        self.apology_lines[index].clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterEntry {
    pub name: String,
    pub handle: u64,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// "gateway" for the real WebSocket link, "mock" for local development
    #[serde(default = "default_platform_kind")]
    pub kind: String,
    #[serde(default)]
    pub gateway_url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

// Custom Debug impl to redact the platform credential
impl std::fmt::Debug for PlatformConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformConfig")
            .field("kind", &self.kind)
            .field("gateway_url", &self.gateway_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConductorConfig {
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl ConductorConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            attempt_timeout: Duration::from_secs(self.timeout_secs),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_control_host")]
    pub host: String,
    #[serde(default = "default_control_port")]
    pub port: u16,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            host: default_control_host(),
            port: default_control_port(),
            api_key: None,
        }
    }
}

impl std::fmt::Debug for ControlConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Path to the shared store (the deployment's state address)
    pub path: String,
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_fingerprint_ttl_secs")]
    pub fingerprint_ttl_secs: u64,
    #[serde(default = "default_seen_ttl_secs")]
    pub seen_ttl_secs: u64,
}

/// One organic conversation start: a cron expression and the starter lines
/// the persona can open with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Six/seven-field cron expression (sec min hour dom mon dow [year])
    pub cron: String,
    pub channel_id: String,
    pub starters: Vec<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_platform_kind() -> String {
    "gateway".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_control_host() -> String {
    "127.0.0.1".to_string()
}

fn default_control_port() -> u16 {
    8600
}

fn default_session_ttl_secs() -> u64 {
    1800
}

fn default_fingerprint_ttl_secs() -> u64 {
    600
}

fn default_seen_ttl_secs() -> u64 {
    300
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Config {
    /// Load from a TOML file, apply environment overrides, and validate.
    /// Any missing mandatory field is an error — an agent with no
    /// credentials or no conductor address cannot do anything useful.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Config = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment variables override file values so deployments can inject
    /// credentials without writing them to disk
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("TROUPE_CONDUCTOR_URL") {
            self.conductor.url = url;
        }
        if let Ok(token) = std::env::var("TROUPE_PLATFORM_TOKEN") {
            self.platform.token = Some(token);
        }
        if let Ok(url) = std::env::var("TROUPE_GATEWAY_URL") {
            self.platform.gateway_url = Some(url);
        }
        if let Ok(key) = std::env::var("TROUPE_CONTROL_API_KEY") {
            self.control.api_key = Some(key);
        }
        if let Ok(path) = std::env::var("TROUPE_STATE_PATH") {
            self.state.path = path;
        }
        if let Ok(host) = std::env::var("TROUPE_CONTROL_HOST") {
            self.control.host = host;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.persona.name.trim().is_empty() {
            bail!("persona.name must be set");
        }
        if self.conductor.url.trim().is_empty() {
            bail!("conductor.url must be set");
        }
        if self.conductor.max_attempts == 0 {
            bail!("conductor.max_attempts must be at least 1");
        }
        if self.state.path.trim().is_empty() {
            bail!("state.path must be set");
        }
        match self.platform.kind.as_str() {
            "gateway" => {
                if self.platform.gateway_url.as_deref().unwrap_or("").is_empty() {
                    bail!("platform.gateway_url must be set for the gateway platform");
                }
                if self.platform.token.as_deref().unwrap_or("").is_empty() {
                    bail!("platform.token must be set for the gateway platform");
                }
            }
            "mock" => {}
            other => bail!("Unknown platform kind: {}", other),
        }
        for entry in &self.schedule {
            if entry.starters.is_empty() {
                bail!("schedule entry for {} has no starter lines", entry.channel_id);
            }
        }
        Ok(())
    }

    /// Build the immutable identity table from the roster, falling back to a
    /// single-persona roster when none was configured
    pub fn identity_table(&self) -> Result<IdentityTable> {
        let personas: Vec<PersonaIdentity> = if self.roster.is_empty() {
            tracing::warn!("No roster configured — inter-agent relay detection is limited to self");
            vec![PersonaIdentity::new(
                self.persona.name.clone(),
                self.persona.handle,
            )]
        } else {
            let mut personas: Vec<PersonaIdentity> = self
                .roster
                .iter()
                .map(|e| PersonaIdentity::new(e.name.clone(), e.handle))
                .collect();
            // The own persona must be present even if the operator forgot it
            if !personas
                .iter()
                .any(|p| p.name.eq_ignore_ascii_case(&self.persona.name))
            {
                personas.push(PersonaIdentity::new(
                    self.persona.name.clone(),
                    self.persona.handle,
                ));
            }
            personas
        };
        IdentityTable::new(&self.persona.name, personas)
    }
}
