//! Joined connections and the inbound message gate.

use std::collections::VecDeque;
use std::net::IpAddr;

use serde_json::{Value, json};
use tandem_wire::{
    Body, DisconnectReason, Envelope, JOIN_FLAG_AUTH, JOIN_FLAG_MOD, MessageKind, ParticipantId,
    ReplyKind, SERVER_CONTEXT, ServerReply,
};
use tracing::{debug, error};

use crate::log::{Level, Topic};
use crate::session::Session;
use crate::state::SessionState;

/// What the transport knows about a user when they log in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub username: String,
    /// External auth server id. Empty for guests.
    pub ext_auth_id: String,
    pub avatar: Vec<u8>,
    pub peer: Option<IpAddr>,
    pub authenticated: bool,
    pub moderator: bool,
    /// Operator status granted at login (e.g. a correct opword).
    pub operator: bool,
    pub secure: bool,
}

/// A member of a session.
#[derive(Debug)]
pub struct ClientConnection {
    pub(crate) id: ParticipantId,
    pub(crate) info: ClientInfo,
    pub(crate) operator: bool,
    pub(crate) trusted: bool,
    pub(crate) muted: bool,
    /// Next history index to send.
    pub(crate) history_position: u64,
    /// Messages received while the session was not accepting drawing.
    pub(crate) hold_queue: Vec<Envelope>,
    pub(crate) outbox: VecDeque<Envelope>,
    /// The transport holds a batch it hasn't finished writing.
    pub(crate) in_flight: bool,
}

impl ClientConnection {
    pub(crate) fn new(id: ParticipantId, info: ClientInfo) -> Self {
        Self {
            id,
            info,
            operator: false,
            trusted: false,
            muted: false,
            history_position: 0,
            hold_queue: Vec::new(),
            outbox: VecDeque::new(),
            in_flight: false,
        }
    }

    pub fn id(&self) -> ParticipantId {
        self.id
    }

    pub fn info(&self) -> &ClientInfo {
        &self.info
    }

    pub fn username(&self) -> &str {
        &self.info.username
    }

    /// Moderators are always operators.
    pub fn is_operator(&self) -> bool {
        self.operator || self.info.moderator
    }

    pub fn is_moderator(&self) -> bool {
        self.info.moderator
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn history_position(&self) -> u64 {
        self.history_position
    }

    pub fn held(&self) -> usize {
        self.hold_queue.len()
    }

    /// Messages queued for the transport.
    pub fn pending(&self) -> usize {
        self.outbox.len()
    }

    pub fn join_message(&self) -> Envelope {
        let mut flags = 0;
        if self.info.authenticated {
            flags |= JOIN_FLAG_AUTH;
        }
        if self.info.moderator {
            flags |= JOIN_FLAG_MOD;
        }
        Envelope::user_join(self.id, flags, self.info.username.clone(), self.info.avatar.clone())
    }

    pub fn description(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.info.username,
            "ip": self.info.peer.map(|ip| ip.to_string()),
            "auth": self.info.authenticated,
            "op": self.is_operator(),
            "muted": self.muted,
            "mod": self.info.moderator,
            "tls": self.info.secure,
        })
    }
}

impl Session {
    /// Handle a message received from a member.
    pub fn handle_client_message(&mut self, from: ParticipantId, mut msg: Envelope) {
        let Some(client) = self.client(from) else {
            debug!(session = %self.id(), user = from, "message from unknown user dropped");
            return;
        };
        let is_operator = client.is_operator();
        let is_muted = client.muted;
        let username = client.info.username.clone();

        let kind = msg.kind();
        match kind {
            MessageKind::Disconnect | MessageKind::Empty => return,
            k if k.is_server_only() => {
                self.log_user(
                    from,
                    Level::Warn,
                    Topic::RuleBreak,
                    format!("Sent server-only message {}", k.as_str()),
                );
                return;
            }
            _ => {}
        }

        // Only the snapshot uploader may speak for other contexts
        if self.init_user != Some(from) {
            msg.set_context_id(from);
        }

        match kind {
            MessageKind::Command => {
                match msg.server_command() {
                    Some(Ok(cmd)) => self.handle_server_command(from, cmd),
                    _ => self.log_user(
                        from,
                        Level::Warn,
                        Topic::RuleBreak,
                        "Sent an invalid command",
                    ),
                }
                return;
            }
            MessageKind::SessionOwner => {
                if !is_operator {
                    self.log_user(
                        from,
                        Level::Warn,
                        Topic::RuleBreak,
                        "Tried to change session ownership",
                    );
                    return;
                }
                let mut ids = msg.id_list().map(<[_]>::to_vec).unwrap_or_default();
                // An operator can't deop themselves this way
                ids.push(from);
                let ops = self.update_ownership(&ids, &username);
                msg.set_id_list(ops);
            }
            MessageKind::TrustedUsers => {
                if !is_operator {
                    self.log_user(
                        from,
                        Level::Warn,
                        Topic::RuleBreak,
                        "Tried to change trusted user list",
                    );
                    return;
                }
                let ids = msg.id_list().map(<[_]>::to_vec).unwrap_or_default();
                let trusted = self.update_trusted_users(&ids, &username);
                msg.set_id_list(trusted);
            }
            MessageKind::Chat => {
                if is_muted {
                    return;
                }
                if msg.is_bypass_chat() {
                    self.direct_to_all(msg);
                    return;
                }
            }
            MessageKind::PrivateChat => {
                // Muting only silences public chat
                let target = match &msg.body {
                    Some(Body::PrivateChat(pm)) => ParticipantId::try_from(pm.target).ok(),
                    _ => None,
                };
                if let Some(target) = target
                    && target != SERVER_CONTEXT
                    && self.client(target).is_some()
                {
                    if target != from {
                        self.send_direct(target, msg.clone());
                    }
                    self.send_direct(from, msg);
                }
                return;
            }
            _ => {}
        }

        self.route_message(from, msg);
    }

    fn route_message(&mut self, from: ParticipantId, msg: Envelope) {
        let uploading = self.init_user == Some(from)
            && matches!(
                self.state,
                SessionState::Initializing | SessionState::Resetting
            );

        if uploading {
            self.add_to_init_stream(msg);
        } else if self.state != SessionState::Running {
            if self.history.is_out_of_space() {
                return;
            }
            if let Some(c) = self.client_mut(from) {
                c.hold_queue.push(msg);
            }
        } else {
            self.add_to_history(msg);
        }
    }

    // ========================================================================
    // Delivery
    // ========================================================================

    /// Queue a message for one member.
    pub fn send_direct(&mut self, id: ParticipantId, msg: Envelope) {
        if let Some(c) = self.client_mut(id) {
            c.outbox.push_back(msg);
        }
    }

    /// Server chat line visible only to one member.
    pub fn send_system_message(&mut self, id: ParticipantId, message: &str) {
        self.send_direct(
            id,
            Envelope::reply(&ServerReply::new(ReplyKind::Message, message)),
        );
    }

    /// Queue the next history batch for a member that is caught up with
    /// its outbox.
    pub fn send_next_history_batch(&mut self, id: ParticipantId) {
        if self.state != SessionState::Running {
            return;
        }

        let Some(c) = self.client(id) else { return };
        if c.in_flight || !c.outbox.is_empty() {
            return;
        }
        let position = c.history_position;
        if position >= self.history.end_index() {
            return;
        }

        match self.history.get_batch(position) {
            Ok(batch) => {
                if let Some(c) = self.client_mut(id) {
                    c.history_position = batch.next;
                    c.outbox.extend(batch.messages);
                }
            }
            Err(e) => {
                error!(session = %self.id(), user = id, error = %e, "history read failed");
                self.disconnect(id, DisconnectReason::Error, "History read failed");
            }
        }
    }

    /// Something was added to history.
    pub(crate) fn history_updated(&mut self) {
        let ids: Vec<_> = self.clients.iter().map(|c| c.id).collect();
        for id in ids {
            self.send_next_history_batch(id);
        }
    }

    /// Hand the member's queued messages to the transport. The member gets
    /// nothing more from history until [`Session::all_sent`].
    pub fn take_outbox(&mut self, id: ParticipantId) -> Vec<Envelope> {
        if let Some(c) = self.client_mut(id) {
            if c.outbox.is_empty() {
                return Vec::new();
            }
            c.in_flight = true;
            return c.outbox.drain(..).collect();
        }

        self.departed
            .iter_mut()
            .find(|c| c.id == id)
            .map(|c| c.outbox.drain(..).collect())
            .unwrap_or_default()
    }

    /// The transport finished writing the last batch.
    pub fn all_sent(&mut self, id: ParticipantId) {
        let Some(c) = self.client_mut(id) else { return };
        c.in_flight = false;
        self.history_cache_cleanup();
        self.send_next_history_batch(id);
    }

    /// Removed members with their final messages. The transport sends those
    /// and then closes the connection.
    pub fn take_departed(&mut self) -> Vec<(ParticipantId, Vec<Envelope>)> {
        self.departed
            .drain(..)
            .map(|mut c| (c.id, c.outbox.drain(..).collect()))
            .collect()
    }

    /// Ids of members with queued messages.
    pub fn pending_outboxes(&self) -> Vec<ParticipantId> {
        self.clients
            .iter()
            .filter(|c| !c.outbox.is_empty())
            .map(|c| c.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moderator_is_always_operator() {
        let c = ClientConnection::new(
            4,
            ClientInfo {
                username: "mod".into(),
                moderator: true,
                ..Default::default()
            },
        );
        assert!(c.is_operator());
        assert_eq!(c.description()["mod"], true);
        assert_eq!(c.description()["ip"], Value::Null);
    }

    #[test]
    fn test_join_message_flags() {
        let c = ClientConnection::new(
            2,
            ClientInfo {
                username: "alice".into(),
                authenticated: true,
                ..Default::default()
            },
        );
        let msg = c.join_message();
        assert_eq!(msg.context_id(), 2);
        match msg.body {
            Some(Body::UserJoin(join)) => {
                assert_eq!(join.flags, JOIN_FLAG_AUTH);
                assert_eq!(join.name, "alice");
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }
}
