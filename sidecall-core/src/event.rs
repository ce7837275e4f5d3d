//! Domain events relayed between paired devices.

/// A logical phone event exchanged over the peer link. Created at the point
/// of detection (the call/SMS observers) or when decoding an inbound wire
/// frame; consumed exactly once by the dispatch path or the send path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    /// The phone is ringing with this caller number.
    IncomingCall { number: String },
    /// An SMS arrived.
    IncomingSms { sender: String, body: String },
    /// The call stopped ringing on the phone side; take down the mirrored alert.
    DismissCurrentCall,
    /// The call rang out unanswered.
    MissedCall { number: String },
    /// Unrecognized wire frame, carried through for best-effort display.
    Raw(String),
}
