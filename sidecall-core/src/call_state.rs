//! Call-state tracking: telephony transitions to relayed events.

use crate::event::DomainEvent;

/// Telephony state change as reported by the platform observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhoneState {
    /// Ringing, with the caller number when the platform reveals it.
    Ringing(Option<String>),
    /// A call went active: answered locally, or outgoing.
    OffHook,
    Idle,
}

/// Tracks ringing across state changes so an idle transition can be
/// classified as a missed call. One tracker per device.
#[derive(Debug, Default)]
pub struct CallStateTracker {
    ringing: bool,
    incoming_number: Option<String>,
}

impl CallStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one state change; returns the event to relay, if any.
    pub fn on_state(&mut self, state: PhoneState) -> Option<DomainEvent> {
        match state {
            PhoneState::Ringing(number) => {
                self.ringing = true;
                self.incoming_number = number.clone();
                number.map(|number| DomainEvent::IncomingCall { number })
            }
            PhoneState::OffHook => {
                // Answered here or dialing out; either way the peer's alert goes away.
                self.ringing = false;
                Some(DomainEvent::DismissCurrentCall)
            }
            PhoneState::Idle => {
                let missed = if self.ringing {
                    self.incoming_number
                        .take()
                        .map(|number| DomainEvent::MissedCall { number })
                } else {
                    None
                };
                self.ringing = false;
                self.incoming_number = None;
                missed
            }
        }
    }
}
