//! Event message codec: one colon-delimited UTF-8 text frame per logical event.
//!
//! The frame layout is the compatibility boundary with the peer device; the
//! field delimiter, the split-limit semantics, and the pass-through fallback
//! must not change. Fields are not escaped, so a number or sender containing
//! `:` splits as-is (known fragility, kept for compatibility).

use crate::event::DomainEvent;

/// Encode a domain event into its wire frame.
pub fn encode(event: &DomainEvent) -> String {
    match event {
        DomainEvent::IncomingCall { number } => format!("call:{number}"),
        DomainEvent::IncomingSms { sender, body } => format!("sms:{sender}:{body}"),
        DomainEvent::DismissCurrentCall => "action:dismiss".to_string(),
        DomainEvent::MissedCall { number } => format!("action:missed_call:{number}"),
        DomainEvent::Raw(raw) => raw.clone(),
    }
}

/// Decode a wire frame. The frame splits on `:` into at most 3 top-level
/// parts; an unrecognized first part becomes [`DomainEvent::Raw`] so that
/// protocol skew between peers degrades to "show something" instead of
/// silence. Returns `None` for an empty frame and for incomplete `action`
/// frames, where there is nothing to dispatch.
pub fn decode(raw: &str) -> Option<DomainEvent> {
    if raw.is_empty() {
        return None;
    }
    let mut parts = raw.splitn(3, ':');
    let kind = parts.next().unwrap_or("");
    match kind {
        "action" => match parts.next() {
            Some("dismiss") => Some(DomainEvent::DismissCurrentCall),
            Some("missed_call") => parts.next().map(|number| DomainEvent::MissedCall {
                number: number.to_string(),
            }),
            _ => None,
        },
        "call" => Some(DomainEvent::IncomingCall {
            number: rejoin(parts),
        }),
        "sms" => {
            let rest = rejoin(parts);
            // Inner split, limit 2: the body keeps any embedded colons.
            let (sender, body) = rest.split_once(':').unwrap_or((rest.as_str(), ""));
            Some(DomainEvent::IncomingSms {
                sender: sender.to_string(),
                body: body.to_string(),
            })
        }
        _ => Some(DomainEvent::Raw(raw.to_string())),
    }
}

/// Rejoin the tail of the outer split, restoring the colon the split limit kept.
fn rejoin(parts: std::str::SplitN<'_, char>) -> String {
    parts.collect::<Vec<_>>().join(":")
}
