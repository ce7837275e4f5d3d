//! SideCall protocol core.
//! Host-driven: no I/O; the owner feeds transport events and executes the returned commands.

pub mod call_state;
pub mod channel_id;
pub mod codec;
pub mod endpoint;
pub mod event;
pub mod manager;
pub mod render;

pub use call_state::{CallStateTracker, PhoneState};
pub use channel_id::{derive_channel_id, ChannelIdError};
pub use codec::{decode, encode};
pub use endpoint::{Endpoint, EndpointId};
pub use event::DomainEvent;
pub use manager::{
    ConnectionManager, ConnectionOutcome, Phase, TransportCommand, TransportEvent,
};
pub use render::{apply_event, ContactResolver, LatestChange, NotificationDispatch};
