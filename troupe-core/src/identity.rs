// ABOUTME: Immutable persona identity roster built once at startup
// ABOUTME: Maps persona names to platform handles and derives mention tokens

use anyhow::{bail, Result};

/// One persona's identity as known to every agent in the troupe.
///
/// The handle is assigned by the chat platform; the mention token is derived
/// from it. A handle of 0 means the operator never resolved this persona's
/// platform identity — mention detection for it degrades to a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonaIdentity {
    pub name: String,
    pub handle: u64,
}

impl PersonaIdentity {
    pub fn new(name: impl Into<String>, handle: u64) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    /// Mention token for this persona, `None` when the handle is unresolved
    pub fn mention(&self) -> Option<String> {
        (self.handle != 0).then(|| format!("<@{}>", self.handle))
    }

    /// Case-insensitive command prefix (`!name`)
    pub fn command_prefix(&self) -> String {
        format!("!{}", self.name.to_lowercase())
    }
}

/// The full roster, shared read-only across the resolver, the runtime, and
/// the conductor client. Built once during startup and never mutated; every
/// agent process loads the same roster so inter-agent mentions resolve
/// identically everywhere.
#[derive(Debug, Clone)]
pub struct IdentityTable {
    own_index: usize,
    personas: Vec<PersonaIdentity>,
}

impl IdentityTable {
    /// Build the table. Fails if `own_name` is not in the roster; personas
    /// with unresolved handles are kept but logged, since other personas
    /// must keep functioning.
    pub fn new(own_name: &str, personas: Vec<PersonaIdentity>) -> Result<Self> {
        if personas.is_empty() {
            bail!("Persona roster is empty");
        }

        let own_index = match personas
            .iter()
            .position(|p| p.name.eq_ignore_ascii_case(own_name))
        {
            Some(i) => i,
            None => bail!("Own persona '{}' is not in the roster", own_name),
        };

        for persona in &personas {
            if persona.mention().is_none() {
                tracing::warn!(
                    persona = %persona.name,
                    "Persona has no resolvable mention token — relay detection for it is disabled"
                );
            }
        }

        Ok(Self {
            own_index,
            personas,
        })
    }

    /// The persona this process embodies
    pub fn own(&self) -> &PersonaIdentity {
        &self.personas[self.own_index]
    }

    pub fn by_handle(&self, handle: u64) -> Option<&PersonaIdentity> {
        if handle == 0 {
            return None;
        }
        self.personas.iter().find(|p| p.handle == handle)
    }

    pub fn by_name(&self, name: &str) -> Option<&PersonaIdentity> {
        self.personas
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// All personas other than this one
    pub fn siblings(&self) -> impl Iterator<Item = &PersonaIdentity> {
        let own = self.own_index;
        self.personas
            .iter()
            .enumerate()
            .filter(move |(i, _)| *i != own)
            .map(|(_, p)| p)
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }
}
