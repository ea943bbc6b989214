// ABOUTME: Pure inbound-event classification and initiator election
// ABOUTME: Decides per event whether this persona ignores, initiates, or accepts a relay

use crate::identity::IdentityTable;
use crate::traits::InboundEvent;

/// What this persona should do with an inbound event.
///
/// At most one of the non-ignore variants fires per persona per event, and
/// only the addressed persona's variant fires per event — that pairing is
/// what makes initiator election work without a distributed lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Not addressed to this persona, or authored by it
    Ignore,
    /// A human addressed this persona directly; `text` is the body with the
    /// prefix or mention token stripped
    HumanDirect { text: String },
    /// Another agent handed the conversation to this persona mid-thread
    AgentRelay { text: String },
}

impl Disposition {
    pub fn is_ignore(&self) -> bool {
        matches!(self, Self::Ignore)
    }
}

/// Classify an inbound event for the persona owning `table`.
///
/// Never fails: malformed or ambiguous input degrades to `Ignore` so one bad
/// event cannot take down the dispatch loop.
pub fn classify(event: &InboundEvent, table: &IdentityTable) -> Disposition {
    let own = table.own();

    // Never process our own messages, whatever they contain
    if event.author.is_agent && event.author.handle == own.handle {
        return Disposition::Ignore;
    }

    let body = event.body.trim();
    if body.is_empty() {
        return Disposition::Ignore;
    }

    // Command prefix: "!name", case-insensitive, at a word boundary.
    // Only humans address personas this way; agents use mention tokens.
    if let Some(rest) = strip_command_prefix(body, &own.command_prefix()) {
        if !event.author.is_agent {
            return Disposition::HumanDirect {
                text: rest.trim().to_string(),
            };
        }
        return Disposition::Ignore;
    }

    // Mention token: requires a resolved handle; an unresolved own identity
    // silently disables this branch (prefix addressing still works).
    if own.mention().is_some() && contains_mention(body, own.handle) {
        let text = strip_mentions(body, own.handle);
        if event.author.is_agent {
            return Disposition::AgentRelay { text };
        }
        return Disposition::HumanDirect { text };
    }

    Disposition::Ignore
}

/// Strip `prefix` from the start of `body` case-insensitively, requiring the
/// prefix to end at a word boundary. Returns the remainder on a match.
fn strip_command_prefix<'a>(body: &'a str, prefix: &str) -> Option<&'a str> {
    let head = body.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let rest = &body[prefix.len()..];
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        Some(rest)
    } else {
        // "!peterpan" is not an address of "!peter"
        None
    }
}

/// Both plain and nickname mention forms count: `<@123>` and `<@!123>`
fn mention_forms(handle: u64) -> [String; 2] {
    [format!("<@{}>", handle), format!("<@!{}>", handle)]
}

fn contains_mention(body: &str, handle: u64) -> bool {
    mention_forms(handle).iter().any(|m| body.contains(m.as_str()))
}

/// Remove every occurrence of the persona's mention tokens and collapse the
/// surrounding whitespace, keeping the rest of the text verbatim.
fn strip_mentions(body: &str, handle: u64) -> String {
    let mut text = body.to_string();
    for form in mention_forms(handle) {
        text = text.replace(&form, " ");
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
