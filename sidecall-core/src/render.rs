//! Notification dispatch boundary and user-facing message rendering.
//!
//! Incoming calls and new messages share one alert surface; missed calls get
//! their own; a dismissal cancels the incoming alert and clears the latest
//! message. The rendered strings also feed the observable latest-message
//! value the UI layer watches.

use tracing::debug;

use crate::event::DomainEvent;

/// Platform notification surface. Implementations render and cancel alerts;
/// this core only drives the calls.
pub trait NotificationDispatch: Send + Sync {
    fn show_incoming_call(&self, title: &str, body: &str);
    fn show_missed_call(&self, body: &str);
    fn cancel_incoming_call(&self);
}

/// Contact-name lookup. A miss, a blank number, or a failing platform lookup
/// all mean "no enrichment available": the raw number is shown instead.
pub trait ContactResolver: Send + Sync {
    fn display_name(&self, number: &str) -> Option<String>;
}

/// Change to the observable latest-message value after applying an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LatestChange {
    Set(String),
    Clear,
}

/// Apply one decoded event to the notification surface and report the new
/// latest-message value.
pub fn apply_event(
    event: &DomainEvent,
    contacts: &dyn ContactResolver,
    dispatch: &dyn NotificationDispatch,
) -> LatestChange {
    match event {
        DomainEvent::IncomingCall { number } => {
            let body = match lookup(contacts, number) {
                Some(name) => format!("{name} ({number})"),
                None => number.clone(),
            };
            dispatch.show_incoming_call("Incoming Call", &body);
            LatestChange::Set(format!("Incoming Call\n{body}"))
        }
        DomainEvent::IncomingSms { sender, body } => {
            let text = match lookup(contacts, sender) {
                Some(name) => format!("From: {name} ({sender})\n{body}"),
                None => format!("From: {sender}\n{body}"),
            };
            dispatch.show_incoming_call("New Message", &text);
            LatestChange::Set(format!("New Message\n{text}"))
        }
        DomainEvent::DismissCurrentCall => {
            dispatch.cancel_incoming_call();
            LatestChange::Clear
        }
        DomainEvent::MissedCall { number } => {
            // The call is no longer ringing; the incoming alert goes first.
            dispatch.cancel_incoming_call();
            let text = match lookup(contacts, number) {
                Some(name) => format!("Missed call from: {name} ({number})"),
                None => format!("Missed call from: {number}"),
            };
            dispatch.show_missed_call(&text);
            LatestChange::Set(text)
        }
        DomainEvent::Raw(raw) => {
            debug!(frame = %raw, "unrecognized frame; showing as-is");
            dispatch.show_incoming_call("", raw);
            LatestChange::Set(format!("\n{raw}"))
        }
    }
}

fn lookup(contacts: &dyn ContactResolver, number: &str) -> Option<String> {
    if number.trim().is_empty() {
        return None;
    }
    contacts.display_name(number)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Incoming { title: String, body: String },
        Missed { body: String },
        Cancel,
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Call>>);

    impl Recorder {
        fn take(&self) -> Vec<Call> {
            std::mem::take(&mut self.0.lock().unwrap())
        }
    }

    impl NotificationDispatch for Recorder {
        fn show_incoming_call(&self, title: &str, body: &str) {
            self.0.lock().unwrap().push(Call::Incoming {
                title: title.to_string(),
                body: body.to_string(),
            });
        }

        fn show_missed_call(&self, body: &str) {
            self.0.lock().unwrap().push(Call::Missed {
                body: body.to_string(),
            });
        }

        fn cancel_incoming_call(&self) {
            self.0.lock().unwrap().push(Call::Cancel);
        }
    }

    struct Contacts(HashMap<String, String>);

    impl Contacts {
        fn with(number: &str, name: &str) -> Self {
            Contacts(HashMap::from([(number.to_string(), name.to_string())]))
        }

        fn empty() -> Self {
            Contacts(HashMap::new())
        }
    }

    impl ContactResolver for Contacts {
        fn display_name(&self, number: &str) -> Option<String> {
            self.0.get(number).cloned()
        }
    }

    #[test]
    fn incoming_call_with_contact_enrichment() {
        let recorder = Recorder::default();
        let change = apply_event(
            &DomainEvent::IncomingCall {
                number: "5551234".to_string(),
            },
            &Contacts::with("5551234", "Alice"),
            &recorder,
        );
        assert_eq!(
            recorder.take(),
            vec![Call::Incoming {
                title: "Incoming Call".to_string(),
                body: "Alice (5551234)".to_string(),
            }]
        );
        assert_eq!(
            change,
            LatestChange::Set("Incoming Call\nAlice (5551234)".to_string())
        );
    }

    #[test]
    fn incoming_call_falls_back_to_the_raw_number() {
        let recorder = Recorder::default();
        let change = apply_event(
            &DomainEvent::IncomingCall {
                number: "5551234".to_string(),
            },
            &Contacts::empty(),
            &recorder,
        );
        assert_eq!(
            recorder.take(),
            vec![Call::Incoming {
                title: "Incoming Call".to_string(),
                body: "5551234".to_string(),
            }]
        );
        assert_eq!(change, LatestChange::Set("Incoming Call\n5551234".to_string()));
    }

    #[test]
    fn sms_renders_sender_and_body() {
        let recorder = Recorder::default();
        let change = apply_event(
            &DomainEvent::IncomingSms {
                sender: "5551234".to_string(),
                body: "see you at 5".to_string(),
            },
            &Contacts::with("5551234", "Alice"),
            &recorder,
        );
        assert_eq!(
            recorder.take(),
            vec![Call::Incoming {
                title: "New Message".to_string(),
                body: "From: Alice (5551234)\nsee you at 5".to_string(),
            }]
        );
        assert_eq!(
            change,
            LatestChange::Set("New Message\nFrom: Alice (5551234)\nsee you at 5".to_string())
        );
    }

    #[test]
    fn dismiss_cancels_and_clears() {
        let recorder = Recorder::default();
        let change = apply_event(
            &DomainEvent::DismissCurrentCall,
            &Contacts::empty(),
            &recorder,
        );
        assert_eq!(recorder.take(), vec![Call::Cancel]);
        assert_eq!(change, LatestChange::Clear);
    }

    #[test]
    fn missed_call_cancels_the_incoming_alert_first() {
        let recorder = Recorder::default();
        let change = apply_event(
            &DomainEvent::MissedCall {
                number: "5551234".to_string(),
            },
            &Contacts::empty(),
            &recorder,
        );
        assert_eq!(
            recorder.take(),
            vec![
                Call::Cancel,
                Call::Missed {
                    body: "Missed call from: 5551234".to_string(),
                },
            ]
        );
        assert_eq!(
            change,
            LatestChange::Set("Missed call from: 5551234".to_string())
        );
    }

    #[test]
    fn raw_frame_is_shown_as_is() {
        let recorder = Recorder::default();
        let change = apply_event(
            &DomainEvent::Raw("garbage".to_string()),
            &Contacts::empty(),
            &recorder,
        );
        assert_eq!(
            recorder.take(),
            vec![Call::Incoming {
                title: String::new(),
                body: "garbage".to_string(),
            }]
        );
        assert_eq!(change, LatestChange::Set("\ngarbage".to_string()));
    }

    #[test]
    fn blank_numbers_skip_the_lookup() {
        let recorder = Recorder::default();
        let change = apply_event(
            &DomainEvent::IncomingCall {
                number: String::new(),
            },
            &Contacts::with("", "Nobody"),
            &recorder,
        );
        assert_eq!(change, LatestChange::Set("Incoming Call\n".to_string()));
    }
}
