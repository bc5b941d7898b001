pub mod identity;
pub mod protocol;

pub use identity::{Identity, Presence, PresenceUpdate};
pub use protocol::{
    decode_client_message, forward_payload, settings_reply, unavailable_reply, ClientMessage,
    InboundFields, ProtocolError, SignalError, DEFAULT_MAX_FRAME_BYTES,
};
