//! Tandem Wire Types
//!
//! This crate defines the message envelope exchanged between drawing clients
//! and the session server. The server treats almost every message as opaque:
//! it only needs a context id, a byte length, and a handful of typed bodies
//! it must inspect (joins, leaves, chat, ownership and trust lists, commands).
//!
//! # Message Categories
//!
//! - **Meta** (history-bound): UserJoin, UserLeave, SessionOwner, TrustedUsers, Chat
//! - **Control** (never stored by clients): Command, Disconnect, PrivateChat
//! - **Drawing** (opaque): anything the server only orders and replays
//!
//! Server commands and replies travel as JSON inside a `Command` body.

#![deny(unsafe_code)]

pub mod reply;

use prost::Message;

pub use reply::{ReplyKind, ServerCommand, ServerReply};

// ============================================================================
// Type Aliases
// ============================================================================

/// Participant id. Zero is reserved for messages originating from the server.
pub type ParticipantId = u8;

/// Context id of server-originated messages.
pub const SERVER_CONTEXT: ParticipantId = 0;

// ============================================================================
// Envelope
// ============================================================================

/// A single framed message.
///
/// `context_id` is carried as u32 on the wire for protobuf compatibility but
/// is always a [`ParticipantId`] in practice.
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(uint32, tag = "1")]
    pub context_id: u32,

    #[prost(oneof = "Body", tags = "2, 3, 4, 5, 6, 7, 8, 9, 10, 11")]
    pub body: Option<Body>,
}

/// Message bodies the server distinguishes.
#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Body {
    #[prost(message, tag = "2")]
    UserJoin(UserJoin),

    #[prost(message, tag = "3")]
    UserLeave(UserLeave),

    #[prost(message, tag = "4")]
    SoftReset(SoftReset),

    #[prost(message, tag = "5")]
    Disconnect(Disconnect),

    #[prost(message, tag = "6")]
    SessionOwner(IdList),

    #[prost(message, tag = "7")]
    TrustedUsers(IdList),

    #[prost(message, tag = "8")]
    Chat(Chat),

    #[prost(message, tag = "9")]
    PrivateChat(PrivateChat),

    #[prost(message, tag = "10")]
    Command(Command),

    #[prost(message, tag = "11")]
    Drawing(Drawing),
}

/// Announces a participant and its display attributes.
#[derive(Clone, PartialEq, Message)]
pub struct UserJoin {
    /// Bit set of `JOIN_FLAG_*`.
    #[prost(uint32, tag = "1")]
    pub flags: u32,

    #[prost(string, tag = "2")]
    pub name: String,

    #[prost(bytes = "vec", tag = "3")]
    pub avatar: Vec<u8>,
}

pub const JOIN_FLAG_AUTH: u32 = 0x01;
pub const JOIN_FLAG_MOD: u32 = 0x02;

/// Participant left the session. Identity is the envelope context id.
#[derive(Clone, PartialEq, Message)]
pub struct UserLeave {}

/// Server-side soft reset marker.
#[derive(Clone, PartialEq, Message)]
pub struct SoftReset {}

/// Reason attached to a disconnect notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum DisconnectReason {
    Error = 0,
    Kick = 1,
    Shutdown = 2,
    Other = 3,
}

/// Sent to a client right before the server closes its connection.
#[derive(Clone, PartialEq, Message)]
pub struct Disconnect {
    #[prost(enumeration = "DisconnectReason", tag = "1")]
    pub reason: i32,

    #[prost(string, tag = "2")]
    pub message: String,
}

/// A list of participant ids (session owners or trusted users).
#[derive(Clone, PartialEq, Message)]
pub struct IdList {
    #[prost(bytes = "vec", tag = "1")]
    pub ids: Vec<u8>,
}

pub const CHAT_FLAG_BYPASS: u32 = 0x01;
pub const CHAT_FLAG_SHOUT: u32 = 0x02;
pub const CHAT_FLAG_ACTION: u32 = 0x04;
pub const CHAT_FLAG_PIN: u32 = 0x08;

/// Public chat line.
///
/// Bypass chat skips the session history and is only delivered to members
/// present at the time it was sent.
#[derive(Clone, PartialEq, Message)]
pub struct Chat {
    #[prost(uint32, tag = "1")]
    pub flags: u32,

    #[prost(string, tag = "2")]
    pub text: String,
}

/// Chat addressed to one participant.
#[derive(Clone, PartialEq, Message)]
pub struct PrivateChat {
    #[prost(uint32, tag = "1")]
    pub target: u32,

    #[prost(string, tag = "2")]
    pub text: String,
}

/// JSON-encoded [`ServerCommand`] (client to server) or [`ServerReply`]
/// (server to client).
#[derive(Clone, PartialEq, Message)]
pub struct Command {
    #[prost(string, tag = "1")]
    pub json: String,
}

/// Drawing command. The server never looks inside.
#[derive(Clone, PartialEq, Message)]
pub struct Drawing {
    #[prost(uint32, tag = "1")]
    pub kind: u32,

    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

// ============================================================================
// Message Kinds
// ============================================================================

/// Payload-free discriminant of [`Body`], convenient for matching and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    UserJoin,
    UserLeave,
    SoftReset,
    Disconnect,
    SessionOwner,
    TrustedUsers,
    Chat,
    PrivateChat,
    Command,
    Drawing,
    Empty,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserJoin => "UserJoin",
            Self::UserLeave => "UserLeave",
            Self::SoftReset => "SoftReset",
            Self::Disconnect => "Disconnect",
            Self::SessionOwner => "SessionOwner",
            Self::TrustedUsers => "TrustedUsers",
            Self::Chat => "Chat",
            Self::PrivateChat => "PrivateChat",
            Self::Command => "Command",
            Self::Drawing => "Drawing",
            Self::Empty => "Empty",
        }
    }

    /// Kinds that only the server may originate.
    pub fn is_server_only(&self) -> bool {
        matches!(self, Self::UserJoin | Self::UserLeave | Self::SoftReset)
    }
}

// ============================================================================
// Constructors and Accessors
// ============================================================================

impl Envelope {
    fn with_body(context_id: ParticipantId, body: Body) -> Self {
        Self {
            context_id: u32::from(context_id),
            body: Some(body),
        }
    }

    pub fn user_join(
        id: ParticipantId,
        flags: u32,
        name: impl Into<String>,
        avatar: Vec<u8>,
    ) -> Self {
        Self::with_body(
            id,
            Body::UserJoin(UserJoin {
                flags,
                name: name.into(),
                avatar,
            }),
        )
    }

    pub fn user_leave(id: ParticipantId) -> Self {
        Self::with_body(id, Body::UserLeave(UserLeave {}))
    }

    pub fn session_owner(context_id: ParticipantId, ids: Vec<ParticipantId>) -> Self {
        Self::with_body(context_id, Body::SessionOwner(IdList { ids }))
    }

    pub fn trusted_users(context_id: ParticipantId, ids: Vec<ParticipantId>) -> Self {
        Self::with_body(context_id, Body::TrustedUsers(IdList { ids }))
    }

    pub fn chat(context_id: ParticipantId, flags: u32, text: impl Into<String>) -> Self {
        Self::with_body(
            context_id,
            Body::Chat(Chat {
                flags,
                text: text.into(),
            }),
        )
    }

    pub fn private_chat(
        context_id: ParticipantId,
        target: ParticipantId,
        text: impl Into<String>,
    ) -> Self {
        Self::with_body(
            context_id,
            Body::PrivateChat(PrivateChat {
                target: u32::from(target),
                text: text.into(),
            }),
        )
    }

    pub fn drawing(context_id: ParticipantId, kind: u32, payload: Vec<u8>) -> Self {
        Self::with_body(context_id, Body::Drawing(Drawing { kind, payload }))
    }

    pub fn disconnect(reason: DisconnectReason, message: impl Into<String>) -> Self {
        Self::with_body(
            SERVER_CONTEXT,
            Body::Disconnect(Disconnect {
                reason: reason as i32,
                message: message.into(),
            }),
        )
    }

    /// Server reply wrapped in a `Command` envelope from context 0.
    pub fn reply(reply: &ServerReply) -> Self {
        Self::with_body(
            SERVER_CONTEXT,
            Body::Command(Command {
                json: reply.to_json_string(),
            }),
        )
    }

    /// Client command wrapped in a `Command` envelope.
    pub fn command(context_id: ParticipantId, command: &ServerCommand) -> Self {
        Self::with_body(
            context_id,
            Body::Command(Command {
                json: command.to_json_string(),
            }),
        )
    }

    /// Context id narrowed to a participant id. Out-of-range values map to 0.
    pub fn context_id(&self) -> ParticipantId {
        ParticipantId::try_from(self.context_id).unwrap_or(SERVER_CONTEXT)
    }

    pub fn set_context_id(&mut self, id: ParticipantId) {
        self.context_id = u32::from(id);
    }

    pub fn kind(&self) -> MessageKind {
        match &self.body {
            Some(Body::UserJoin(_)) => MessageKind::UserJoin,
            Some(Body::UserLeave(_)) => MessageKind::UserLeave,
            Some(Body::SoftReset(_)) => MessageKind::SoftReset,
            Some(Body::Disconnect(_)) => MessageKind::Disconnect,
            Some(Body::SessionOwner(_)) => MessageKind::SessionOwner,
            Some(Body::TrustedUsers(_)) => MessageKind::TrustedUsers,
            Some(Body::Chat(_)) => MessageKind::Chat,
            Some(Body::PrivateChat(_)) => MessageKind::PrivateChat,
            Some(Body::Command(_)) => MessageKind::Command,
            Some(Body::Drawing(_)) => MessageKind::Drawing,
            None => MessageKind::Empty,
        }
    }

    pub fn is_command(&self) -> bool {
        matches!(self.body, Some(Body::Command(_)))
    }

    /// Serialized size in bytes. All history size accounting uses this.
    pub fn byte_len(&self) -> u64 {
        self.encoded_len() as u64
    }

    /// Ids carried by a SessionOwner or TrustedUsers body.
    pub fn id_list(&self) -> Option<&[ParticipantId]> {
        match &self.body {
            Some(Body::SessionOwner(list)) | Some(Body::TrustedUsers(list)) => Some(&list.ids),
            _ => None,
        }
    }

    /// Replace the ids of a SessionOwner or TrustedUsers body. No-op otherwise.
    pub fn set_id_list(&mut self, ids: Vec<ParticipantId>) {
        if let Some(Body::SessionOwner(list)) | Some(Body::TrustedUsers(list)) = &mut self.body {
            list.ids = ids;
        }
    }

    pub fn is_bypass_chat(&self) -> bool {
        matches!(&self.body, Some(Body::Chat(chat)) if chat.flags & CHAT_FLAG_BYPASS != 0)
    }

    /// Decode the JSON payload of a `Command` body as a client command.
    pub fn server_command(&self) -> Option<Result<ServerCommand, serde_json::Error>> {
        match &self.body {
            Some(Body::Command(cmd)) => Some(serde_json::from_str(&cmd.json)),
            _ => None,
        }
    }

    /// Decode the JSON payload of a `Command` body as a server reply.
    pub fn server_reply(&self) -> Option<ServerReply> {
        match &self.body {
            Some(Body::Command(cmd)) => serde_json::from_str(&cmd.json).ok(),
            _ => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_len_matches_encoding() {
        let msg = Envelope::drawing(3, 130, vec![1, 2, 3, 4, 5]);
        assert_eq!(msg.byte_len() as usize, msg.encode_to_vec().len());
    }

    #[test]
    fn test_envelope_decodes_back() {
        let msg = Envelope::user_join(7, JOIN_FLAG_AUTH, "alice", vec![9, 9]);
        let bytes = msg.encode_to_vec();
        let decoded = Envelope::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.kind(), MessageKind::UserJoin);
        assert_eq!(decoded.context_id(), 7);
    }

    #[test]
    fn test_server_only_kinds() {
        assert!(Envelope::user_join(1, 0, "a", Vec::new()).kind().is_server_only());
        assert!(Envelope::user_leave(1).kind().is_server_only());
        assert!(!Envelope::chat(1, 0, "hi").kind().is_server_only());
        assert!(!Envelope::drawing(1, 1, Vec::new()).kind().is_server_only());
    }

    #[test]
    fn test_id_list_rewrite() {
        let mut msg = Envelope::session_owner(2, vec![1, 2, 3]);
        assert_eq!(msg.id_list(), Some(&[1u8, 2, 3][..]));

        msg.set_id_list(vec![2]);
        assert_eq!(msg.id_list(), Some(&[2u8][..]));

        let mut chat = Envelope::chat(2, 0, "x");
        chat.set_id_list(vec![5]);
        assert_eq!(chat.id_list(), None);
    }

    #[test]
    fn test_out_of_range_context_maps_to_server() {
        let mut msg = Envelope::drawing(1, 1, Vec::new());
        msg.context_id = 1000;
        assert_eq!(msg.context_id(), SERVER_CONTEXT);
    }

    #[test]
    fn test_bypass_chat_flag() {
        assert!(Envelope::chat(1, CHAT_FLAG_BYPASS, "psst").is_bypass_chat());
        assert!(!Envelope::chat(1, CHAT_FLAG_SHOUT, "HEY").is_bypass_chat());
    }

    #[test]
    fn test_reply_envelope_round_trip() {
        let reply = ServerReply::new(ReplyKind::Catchup, "").with("count", 12);
        let msg = Envelope::reply(&reply);
        assert!(msg.is_command());
        assert_eq!(msg.context_id(), SERVER_CONTEXT);

        let back = msg.server_reply().unwrap();
        assert_eq!(back.kind, ReplyKind::Catchup);
        assert_eq!(back.fields["count"], 12);
    }
}
