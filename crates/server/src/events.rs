//! Change notifications for observers outside the session (admin views,
//! session listings). Sessions queue them; nothing inside a session reacts
//! to them.

use tandem_wire::ParticipantId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    UserConnected {
        session: String,
        user: ParticipantId,
        name: String,
    },
    UserDisconnected {
        session: String,
        user: ParticipantId,
    },
    /// Title, flags, password or another listed attribute changed.
    AttributesChanged { session: String },
    /// The session shut down. `terminated` means its history is gone too.
    Ended { session: String, terminated: bool },
}
