//! Session orchestration.
//!
//! A [`Session`] owns its history and every connection joined to it. All
//! mutation happens through `&mut self` on a single task, so handlers run to
//! completion without interleaving. Output is queued: per-connection
//! outboxes, departed connections, outbound HTTP requests and observer
//! events are drained by whoever drives the session (see [`crate::actor`]).

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value, json};
use tandem_history::HistoryStore;
use tandem_record::{RecordingWriter, make_filename_unique};
use tandem_wire::{
    DisconnectReason, Envelope, MessageKind, ParticipantId, ReplyKind, SERVER_CONTEXT, ServerReply,
};
use tracing::{debug, error, info, warn};

use crate::announce::{Announcement, ExternalRequest};
use crate::client::{ClientConnection, ClientInfo};
use crate::config::ServerConfig;
use crate::error::{CommandError, JoinError};
use crate::events::SessionEvent;
use crate::log::{Level, LogEntry, SessionLog, Topic};
use crate::password;
use crate::state::{AutoResetState, SessionState, check_transition};

/// Id allocation attempts before a join is refused.
const ID_ALLOCATION_ATTEMPTS: usize = 256;

pub struct Session {
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) history: HistoryStore,
    pub(crate) state: SessionState,
    /// Participant allowed to upload the init or reset snapshot.
    pub(crate) init_user: Option<ParticipantId>,

    /// Joined connections in join order.
    pub(crate) clients: Vec<ClientConnection>,
    /// Removed connections whose outbox still needs flushing before close.
    pub(crate) departed: Vec<ClientConnection>,

    pub(crate) reset_stream: Vec<Envelope>,
    pub(crate) reset_stream_size: u64,

    pub(crate) closed: bool,
    pub(crate) auth_only: bool,
    pub(crate) autoreset_state: AutoResetState,
    /// Set once the size-limit alert went out; cleared by a successful reset.
    pub(crate) size_limit_alerted: bool,

    pub(crate) last_status_update: Instant,
    pub(crate) last_event: Instant,

    pub(crate) recording_file: Option<PathBuf>,
    pub(crate) recorder: Option<RecordingWriter>,

    pub(crate) session_log: SessionLog,

    pub(crate) listings: Vec<Announcement>,
    pub(crate) refresh_at: Option<Instant>,

    pub(crate) requests: Vec<ExternalRequest>,
    pub(crate) events: Vec<SessionEvent>,
}

impl Session {
    /// Create a session around a history.
    ///
    /// A history that already has content starts out Running; an empty one
    /// waits for its host to upload the initial canvas.
    pub fn new(history: HistoryStore, config: Arc<ServerConfig>) -> Self {
        let mut history = history.with_batch_size(config.history_batch_size);
        history.set_size_limit(config.session_size_limit);
        history.set_autoreset_threshold_base(config.autoreset_threshold_base);
        history.set_autoreset_threshold(config.autoreset_threshold);

        let restored = history.size_bytes() > 0;
        let now = Instant::now();

        let mut session = Self {
            session_log: SessionLog::new(config.log_history_len),
            config,
            history,
            state: SessionState::Initializing,
            init_user: None,
            clients: Vec::new(),
            departed: Vec::new(),
            reset_stream: Vec::new(),
            reset_stream_size: 0,
            closed: false,
            auth_only: false,
            autoreset_state: AutoResetState::NotSent,
            size_limit_alerted: false,
            last_status_update: now,
            last_event: now,
            recording_file: None,
            recorder: None,
            listings: Vec::new(),
            refresh_at: None,
            requests: Vec::new(),
            events: Vec::new(),
        };

        if restored {
            session.state = SessionState::Running;
            // Nobody is connected, so nobody owns the restored session
            session.add_to_history(Envelope::session_owner(SERVER_CONTEXT, Vec::new()));
            session.send_updated_session_properties();
        }

        let urls = session.history.announcements().to_vec();
        for url in urls {
            session.make_announcement(&url, false);
        }

        session
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn id(&self) -> &str {
        self.history.id()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn init_user(&self) -> Option<ParticipantId> {
        self.init_user
    }

    pub fn user_count(&self) -> usize {
        self.clients.len()
    }

    pub fn clients(&self) -> &[ClientConnection] {
        &self.clients
    }

    pub fn client(&self, id: ParticipantId) -> Option<&ClientConnection> {
        self.clients.iter().find(|c| c.id == id)
    }

    pub(crate) fn client_mut(&mut self, id: ParticipantId) -> Option<&mut ClientConnection> {
        self.clients.iter_mut().find(|c| c.id == id)
    }

    pub fn client_by_name(&self, name: &str) -> Option<&ClientConnection> {
        self.clients
            .iter()
            .find(|c| c.info.username.eq_ignore_ascii_case(name))
    }

    pub fn user_names(&self) -> Vec<String> {
        self.clients.iter().map(|c| c.info.username.clone()).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_auth_only(&self) -> bool {
        self.auth_only
    }

    pub fn autoreset_state(&self) -> AutoResetState {
        self.autoreset_state
    }

    pub fn session_log(&self) -> &SessionLog {
        &self.session_log
    }

    /// Time since the last message was added to history.
    pub fn idle_time(&self) -> Duration {
        self.last_event.elapsed()
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_some()
    }

    /// Observer events queued since the last call.
    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    // ========================================================================
    // Logging
    // ========================================================================

    /// Record a log entry, emit it through `tracing` and broadcast it to
    /// members unless it is debug noise.
    pub fn log(&mut self, mut entry: LogEntry) {
        entry.session = self.history.id().to_string();

        let user = entry.user_label(true);
        let topic = entry.topic.as_str();
        match entry.level {
            Level::Error => error!(session = %entry.session, user = %user, topic, "{}", entry.message),
            Level::Warn => warn!(session = %entry.session, user = %user, topic, "{}", entry.message),
            Level::Info => info!(session = %entry.session, user = %user, topic, "{}", entry.message),
            Level::Debug => debug!(session = %entry.session, user = %user, topic, "{}", entry.message),
        }

        if entry.level < Level::Debug {
            let reply = ServerReply {
                kind: ReplyKind::Log,
                message: entry.message.clone(),
                fields: entry.to_json(false),
            };
            self.direct_to_all(Envelope::reply(&reply));
        }

        self.session_log.push(entry);
    }

    /// Log an entry about a member (joined or just departed).
    pub(crate) fn log_user(
        &mut self,
        id: ParticipantId,
        level: Level,
        topic: Topic,
        message: impl Into<String>,
    ) {
        let mut entry = LogEntry::new(level, topic, message);
        let conn = self
            .clients
            .iter()
            .chain(self.departed.iter())
            .find(|c| c.id == id);
        if let Some(c) = conn {
            entry = entry.about(c.id, c.info.peer, &c.info.username);
        }
        self.log(entry);
    }

    // ========================================================================
    // State Machine
    // ========================================================================

    /// Move to a new state and run the transition's side effects.
    ///
    /// # Panics
    ///
    /// On an illegal transition. That is a logic error in the caller.
    pub(crate) fn switch_state(&mut self, new_state: SessionState) {
        if let Err(e) = check_transition(self.state, new_state) {
            panic!("{e}");
        }

        match new_state {
            SessionState::Running => {
                self.init_user = None;
                let mut success = true;

                if self.state == SessionState::Resetting && !self.reset_stream.is_empty() {
                    success = self.commit_reset();
                }
                self.reset_stream.clear();
                self.reset_stream_size = 0;

                self.state = SessionState::Running;

                if success && self.recording_file.is_some() {
                    self.restart_recording();
                }

                self.flush_hold_queues();
                self.history_updated();
            }
            SessionState::Resetting => {
                self.reset_stream.clear();
                self.reset_stream_size = 0;
                self.state = SessionState::Resetting;
                self.message_all("Preparing for session reset!", true);
            }
            SessionState::ShuttingDown | SessionState::Initializing => {
                self.state = new_state;
            }
        }
    }

    /// Replace the history with the uploaded reset snapshot.
    fn commit_reset(&mut self) -> bool {
        let mut owners = Vec::new();
        let mut trusted = Vec::new();
        let mut joins = Vec::with_capacity(self.clients.len());
        for c in &self.clients {
            joins.push(c.join_message());
            if c.is_operator() {
                owners.push(c.id);
            }
            if c.trusted {
                trusted.push(c.id);
            }
        }

        let mut snapshot = Vec::with_capacity(joins.len() + self.reset_stream.len() + 2);
        snapshot.push(Envelope::session_owner(SERVER_CONTEXT, owners));
        if !trusted.is_empty() {
            snapshot.push(Envelope::trusted_users(SERVER_CONTEXT, trusted));
        }
        snapshot.extend(joins);
        snapshot.append(&mut self.reset_stream);

        match self.history.reset(snapshot) {
            Err(e) => {
                // The upload limit is enforced while streaming, so this is rare
                warn!(session = %self.id(), error = %e, "session reset failed");
                self.message_all("Session reset failed!", true);
                false
            }
            Ok(()) => {
                self.direct_to_all(Envelope::reply(
                    &ServerReply::new(ReplyKind::Reset, "Session reset!").with("state", "reset"),
                ));
                self.send_catchup_to_all();

                self.autoreset_state = AutoResetState::NotSent;
                self.size_limit_alerted = false;
                self.send_updated_session_properties();
                true
            }
        }
    }

    fn flush_hold_queues(&mut self) {
        let ids: Vec<_> = self.clients.iter().map(|c| c.id).collect();
        for id in ids {
            let held = match self.client_mut(id) {
                Some(c) => std::mem::take(&mut c.hold_queue),
                None => continue,
            };
            for msg in held {
                self.add_to_history(msg);
            }
        }
    }

    fn catchup_reply(&self) -> Envelope {
        Envelope::reply(&ServerReply::new(ReplyKind::Catchup, "").with("count", self.history.len()))
    }

    fn send_catchup_to_all(&mut self) {
        let msg = self.catchup_reply();
        self.direct_to_all(msg);
    }

    /// Cancel an in-progress reset and keep the current history.
    pub fn abort_reset(&mut self) {
        self.init_user = None;
        self.reset_stream.clear();
        self.reset_stream_size = 0;
        self.switch_state(SessionState::Running);
        self.message_all("Session reset cancelled.", true);
    }

    /// Start a reset with `resetter` as the snapshot uploader.
    pub fn reset_session(&mut self, resetter: ParticipantId) -> Result<(), CommandError> {
        if self.state != SessionState::Running {
            return Err(CommandError::WrongState(self.state.as_str()));
        }
        if self.client(resetter).is_none() {
            return Err(CommandError::UnknownUser(resetter));
        }

        self.init_user = Some(resetter);
        self.switch_state(SessionState::Resetting);

        self.send_direct(
            resetter,
            Envelope::reply(
                &ServerReply::new(ReplyKind::Reset, "Prepared to receive session data")
                    .with("state", "init"),
            ),
        );
        Ok(())
    }

    /// Shut the session down. Calling it again does nothing.
    ///
    /// With `terminate` the history's backing storage is released too.
    pub fn kill_session(&mut self, terminate: bool) {
        if self.state == SessionState::ShuttingDown {
            return;
        }

        self.switch_state(SessionState::ShuttingDown);
        self.unlist_announcement("*", false, false);
        self.stop_recording();

        for mut c in self.clients.drain(..) {
            c.outbox
                .push_back(Envelope::disconnect(DisconnectReason::Shutdown, ""));
            self.departed.push(c);
        }

        if terminate {
            self.history.terminate();
        }

        info!(session = %self.id(), terminate, "session shut down");
        self.events.push(SessionEvent::Ended {
            session: self.id().to_string(),
            terminated: terminate,
        });
    }

    // ========================================================================
    // Init / Reset Protocol
    // ========================================================================

    fn check_init_user(&mut self, ctx_id: ParticipantId, command: &str) -> bool {
        if self.client(ctx_id).is_none() {
            self.log(LogEntry::new(
                Level::Error,
                Topic::RuleBreak,
                format!("Non-existent user {ctx_id} sent {command}"),
            ));
            return false;
        }

        if self.init_user != Some(ctx_id) {
            let current = self
                .init_user
                .map_or_else(|| "none".to_string(), |id| format!("#{id}"));
            self.log_user(
                ctx_id,
                Level::Warn,
                Topic::RuleBreak,
                format!("Sent {command}, but init user is {current}"),
            );
            return false;
        }

        self.log_user(ctx_id, Level::Debug, Topic::Status, command.to_string());
        true
    }

    /// Start of the real snapshot. Drops anything buffered before it.
    pub fn handle_init_begin(&mut self, ctx_id: ParticipantId) {
        if !self.check_init_user(ctx_id, "init-begin") {
            return;
        }

        if self.reset_stream_size > 0 {
            let dropped = self.reset_stream.len();
            self.log_user(
                ctx_id,
                Level::Debug,
                Topic::Status,
                format!("{dropped} extra messages cleared by init-begin"),
            );
            self.reset_stream.clear();
            self.reset_stream_size = 0;
        }
    }

    pub fn handle_init_complete(&mut self, ctx_id: ParticipantId) {
        if self.check_init_user(ctx_id, "init-complete") {
            self.switch_state(SessionState::Running);
        }
    }

    /// Only a reset can be cancelled. An aborted initial upload leaves
    /// nothing to fall back to.
    pub fn handle_init_cancel(&mut self, ctx_id: ParticipantId) {
        if !self.check_init_user(ctx_id, "init-cancel") {
            return;
        }

        if self.state == SessionState::Resetting {
            self.abort_reset();
        } else {
            self.log_user(
                ctx_id,
                Level::Warn,
                Topic::RuleBreak,
                format!("Sent init-cancel in {} state", self.state.as_str()),
            );
        }
    }

    /// First operator to answer an autoreset query gets to do the reset.
    pub fn ready_to_auto_reset(&mut self, ctx_id: ParticipantId) {
        let Some(c) = self.client(ctx_id) else {
            self.log(LogEntry::new(
                Level::Error,
                Topic::RuleBreak,
                format!("Non-existent user {ctx_id} sent ready-to-autoreset"),
            ));
            return;
        };

        if !c.is_operator() {
            self.log_user(
                ctx_id,
                Level::Warn,
                Topic::RuleBreak,
                format!("User {ctx_id} is not an operator, but sent ready-to-autoreset"),
            );
            return;
        }

        if self.autoreset_state != AutoResetState::Queried {
            self.log(LogEntry::new(
                Level::Debug,
                Topic::Status,
                format!("User {ctx_id} was late to respond to an autoreset request"),
            ));
            return;
        }

        self.log(LogEntry::new(
            Level::Info,
            Topic::Status,
            format!("User {ctx_id} responded to autoreset request first"),
        ));

        let request = ServerReply::new(ReplyKind::ResetRequest, "")
            .with("maxSize", self.history.size_limit())
            .with("query", false);
        self.send_direct(ctx_id, Envelope::reply(&request));
        self.autoreset_state = AutoResetState::Requested;
    }

    // ========================================================================
    // History
    // ========================================================================

    /// Append a message to the session history and notify everyone.
    pub fn add_to_history(&mut self, msg: Envelope) {
        if self.state == SessionState::ShuttingDown {
            return;
        }

        if let Err(e) = self.history.add_message(&msg) {
            debug!(session = %self.id(), error = %e, "message rejected");
            if !self.size_limit_alerted {
                self.size_limit_alerted = true;
                let ctx = msg.context_id();
                let shame = self
                    .client(ctx)
                    .map_or_else(|| format!("user #{ctx}"), |c| c.info.username.clone());
                self.message_all("History size limit reached!", true);
                self.message_all(
                    &format!(
                        "{shame} broke the camel's back. Session must be reset to continue drawing."
                    ),
                    false,
                );
            }
            return;
        }

        // The host already has what it uploads, but still needs to see
        // anything else that lands in history meanwhile.
        if self.state == SessionState::Initializing
            && let Some(host) = self.init_user
        {
            let end = self.history.end_index();
            if let Some(c) = self.client_mut(host) {
                c.history_position = end;
                if msg.kind() != MessageKind::Drawing {
                    c.outbox.push_back(msg.clone());
                }
            }
        }

        let record_error = match &mut self.recorder {
            Some(recorder) => recorder.record_message(&msg).err(),
            None => None,
        };
        if let Some(e) = record_error {
            warn!(session = %self.history.id(), error = %e, "recording failed, stopping");
            self.stop_recording();
        }
        self.last_event = Instant::now();

        self.check_autoreset_threshold();

        let interval = Duration::from_secs(self.config.status_update_interval_secs);
        if self.last_status_update.elapsed() > interval {
            let status =
                ServerReply::new(ReplyKind::Status, "").with("size", self.history.size_bytes());
            self.direct_to_all(Envelope::reply(&status));
            self.last_status_update = Instant::now();
        }

        self.history_updated();
    }

    fn check_autoreset_threshold(&mut self) {
        let threshold = self.history.effective_autoreset_threshold();
        if threshold == 0
            || self.autoreset_state != AutoResetState::NotSent
            || self.history.size_bytes() <= threshold
        {
            return;
        }

        const MB: f64 = 1024.0 * 1024.0;
        self.log(LogEntry::new(
            Level::Info,
            Topic::Status,
            format!(
                "Autoreset threshold ({:.1}, effectively {:.1} MB) reached.",
                self.history.autoreset_threshold() as f64 / MB,
                threshold as f64 / MB
            ),
        ));

        // Older clients only understand the plain warning
        let warning = ServerReply::new(ReplyKind::SizeLimitWarning, "")
            .with("size", self.history.size_bytes())
            .with("maxSize", threshold);
        self.direct_to_all(Envelope::reply(&warning));

        let query = Envelope::reply(
            &ServerReply::new(ReplyKind::ResetRequest, "")
                .with("maxSize", self.history.size_limit())
                .with("query", true),
        );
        for c in self.clients.iter_mut().filter(|c| c.is_operator()) {
            c.outbox.push_back(query.clone());
        }

        self.autoreset_state = AutoResetState::Queried;
    }

    /// Route a snapshot message from the initiator.
    pub fn add_to_init_stream(&mut self, msg: Envelope) {
        match self.state {
            SessionState::Initializing => self.add_to_history(msg),
            SessionState::Resetting => {
                self.reset_stream_size += msg.byte_len();
                self.reset_stream.push(msg);

                let limit = self.history.size_limit();
                if limit > 0
                    && self.reset_stream_size > limit
                    && let Some(resetter) = self.init_user
                {
                    self.disconnect(resetter, DisconnectReason::Error, "History limit exceeded");
                }
            }
            SessionState::Running | SessionState::ShuttingDown => {
                debug!(session = %self.id(), "init stream message outside init/reset, dropped");
            }
        }
    }

    /// Spill history batches every member has already received.
    pub fn history_cache_cleanup(&mut self) {
        let min = self
            .clients
            .iter()
            .map(|c| c.history_position)
            .fold(self.history.end_index(), u64::min);
        self.history.cleanup_batches(min);
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Admit a user.
    ///
    /// `host` marks the user who uploads the initial canvas of a new session.
    pub fn join_user(&mut self, info: ClientInfo, host: bool) -> Result<ParticipantId, JoinError> {
        self.check_admission(&info, host)?;

        let id = self.assign_id(&info.username)?;
        let preset_op = host || info.operator;
        let username = info.username.clone();
        let moderator = info.moderator;
        let authenticated = info.authenticated;

        let conn = ClientConnection::new(id, info);
        let join_msg = conn.join_message();
        self.clients.push(conn);

        // Recent session log, oldest first
        let log: Vec<Envelope> = self
            .session_log
            .at_least(Level::Info)
            .map(|e| {
                Envelope::reply(&ServerReply {
                    kind: ReplyKind::Log,
                    message: e.message.clone(),
                    fields: e.to_json(false),
                })
            })
            .collect();
        for msg in log {
            self.send_direct(id, msg);
        }

        if host {
            self.init_user = Some(id);
        } else {
            // Lets the client show a progress bar while catching up
            let catchup = self.catchup_reply();
            self.send_direct(id, catchup);
        }

        if !self.config.welcome_message.is_empty() {
            let welcome = self.config.welcome_message.clone();
            self.send_system_message(id, &welcome);
        }

        self.add_to_history(join_msg);

        if preset_op || moderator || (authenticated && self.history.is_auth_op(&username)) {
            self.change_op_status(id, true, "the server");
        }
        if authenticated && self.history.is_auth_trusted(&username) {
            self.change_trusted_status(id, true, "the server");
        }

        self.ensure_operator_exists();

        self.send_updated_announcement_list();
        self.send_updated_banlist();
        self.send_updated_mute_list();

        self.history.id_queue_mut().set_id_for_name(id, &username);

        self.log_user(id, Level::Info, Topic::Join, "Joined session");
        self.events.push(SessionEvent::UserConnected {
            session: self.id().to_string(),
            user: id,
            name: username,
        });

        Ok(id)
    }

    fn check_admission(&self, info: &ClientInfo, host: bool) -> Result<(), JoinError> {
        if self.state == SessionState::ShuttingDown {
            return Err(JoinError::ShuttingDown);
        }
        if host && (self.state != SessionState::Initializing || self.init_user.is_some()) {
            return Err(JoinError::NotInitializing);
        }
        if self.history.bans().is_banned(info.peer, &info.ext_auth_id) {
            return Err(JoinError::Banned);
        }
        if self.closed && !info.moderator {
            return Err(JoinError::Closed);
        }
        if self.auth_only && !info.authenticated {
            return Err(JoinError::AuthOnly);
        }
        if self.clients.len() >= self.history.max_users() as usize && !info.moderator {
            return Err(JoinError::SessionFull);
        }
        Ok(())
    }

    /// Prefer the id this name had before, else the next free one.
    fn assign_id(&mut self, username: &str) -> Result<ParticipantId, JoinError> {
        let mut id = self.history.id_queue().get_id_for_name(username);
        let mut attempts = ID_ALLOCATION_ATTEMPTS;

        while id == SERVER_CONTEXT || self.client(id).is_some() {
            if attempts == 0 {
                return Err(JoinError::IdsExhausted);
            }
            id = self.history.id_queue_mut().next_id();
            attempts -= 1;
        }
        Ok(id)
    }

    /// Remove a member. Returns the detached connection.
    pub(crate) fn remove_user(&mut self, id: ParticipantId) -> Option<ClientConnection> {
        let pos = self.clients.iter().position(|c| c.id == id)?;
        self.log_user(id, Level::Info, Topic::Leave, "Left session");
        let conn = self.clients.remove(pos);

        if self.init_user == Some(id) {
            match self.state {
                // The resetter left before finishing the upload
                SessionState::Resetting => self.abort_reset(),
                // Let another host pick the upload up
                SessionState::Initializing => self.init_user = None,
                SessionState::Running | SessionState::ShuttingDown => {}
            }
        }

        self.add_to_history(Envelope::user_leave(id));
        // Keep the id out of circulation as long as possible
        self.history.id_queue_mut().reserve_id(id);

        self.ensure_operator_exists();

        if self.clients.is_empty() {
            self.set_closed(false);
        }

        self.history_cache_cleanup();

        self.events.push(SessionEvent::UserDisconnected {
            session: self.id().to_string(),
            user: id,
        });
        Some(conn)
    }

    /// Forcibly disconnect a member. The disconnect notice is queued on the
    /// departed connection.
    pub fn disconnect(&mut self, id: ParticipantId, reason: DisconnectReason, message: &str) {
        if self.client(id).is_none() {
            return;
        }

        match reason {
            DisconnectReason::Kick => {
                self.log_user(id, Level::Info, Topic::Kick, format!("Kicked by {message}"));
            }
            DisconnectReason::Error => {
                self.log_user(
                    id,
                    Level::Warn,
                    Topic::Leave,
                    format!("Disconnected due to error: {message}"),
                );
            }
            DisconnectReason::Shutdown | DisconnectReason::Other => {}
        }

        if let Some(mut conn) = self.remove_user(id) {
            conn.outbox.push_back(Envelope::disconnect(reason, message));
            self.departed.push(conn);
        }
    }

    /// The transport lost the connection.
    pub fn client_disconnected(&mut self, id: ParticipantId) {
        self.remove_user(id);
    }

    // ========================================================================
    // Privileges
    // ========================================================================

    fn announce_op_change(&mut self, id: ParticipantId, op: bool, changed_by: &str) {
        let (topic, msg) = if op {
            (Topic::Op, format!("Made operator by {changed_by}"))
        } else {
            (Topic::Deop, format!("Operator status revoked by {changed_by}"))
        };
        self.log_user(id, Level::Info, topic, msg.clone());

        let Some(c) = self.client(id) else { return };
        let username = c.info.username.clone();
        let persist = c.info.authenticated && !c.info.moderator;
        self.message_all(&format!("{username} {msg}"), false);
        if persist {
            self.history.set_auth_op(&username, op);
        }
    }

    fn announce_trust_change(&mut self, id: ParticipantId, trusted: bool, changed_by: &str) {
        let (topic, msg) = if trusted {
            (Topic::Trust, format!("Trusted by {changed_by}"))
        } else {
            (Topic::Untrust, format!("Untrusted by {changed_by}"))
        };
        self.log_user(id, Level::Info, topic, msg.clone());

        let Some(c) = self.client(id) else { return };
        let username = c.info.username.clone();
        let persist = c.info.authenticated;
        self.message_all(&format!("{username} {msg}"), false);
        if persist {
            self.history.set_auth_trusted(&username, trusted);
        }
    }

    /// Is `id` the reset uploader of a reset in progress?
    fn is_active_resetter(&self, id: ParticipantId) -> bool {
        self.state == SessionState::Resetting && self.init_user == Some(id)
    }

    /// Reconcile operator status against a requested id set.
    ///
    /// Moderators are always operators. Returns the resulting operator ids.
    pub fn update_ownership(&mut self, ids: &[ParticipantId], changed_by: &str) -> Vec<ParticipantId> {
        let mut kick_resetter = None;
        let mut changed = Vec::new();

        for c in &mut self.clients {
            let op = ids.contains(&c.id) || c.info.moderator;
            if op != c.is_operator() {
                if !op && self.state == SessionState::Resetting && self.init_user == Some(c.id) {
                    // Part of the snapshot may still be in flight
                    kick_resetter = Some(c.id);
                }
                c.operator = op;
                changed.push((c.id, op));
            }
        }

        for (id, op) in changed {
            self.announce_op_change(id, op, changed_by);
        }

        let result = self
            .clients
            .iter()
            .filter(|c| c.is_operator())
            .map(|c| c.id)
            .collect();

        if let Some(id) = kick_resetter {
            self.disconnect(id, DisconnectReason::Error, "De-opped while resetting");
        }
        self.ensure_operator_exists();

        result
    }

    /// Grant or revoke operator status of a single member and record the new
    /// operator list in history.
    pub fn change_op_status(&mut self, id: ParticipantId, op: bool, changed_by: &str) {
        // Moderators can't be deopped
        let changed = match self.client_mut(id) {
            Some(c) if c.is_operator() != op && (op || !c.info.moderator) => {
                c.operator = op;
                true
            }
            _ => false,
        };
        if changed {
            self.announce_op_change(id, op, changed_by);
        }
        let kick_resetter = changed && !op && self.is_active_resetter(id);

        let ids = self
            .clients
            .iter()
            .filter(|c| c.is_operator())
            .map(|c| c.id)
            .collect();
        self.add_to_history(Envelope::session_owner(SERVER_CONTEXT, ids));

        if kick_resetter {
            self.disconnect(id, DisconnectReason::Error, "De-opped while resetting");
        }
        if !op {
            self.ensure_operator_exists();
        }
    }

    /// Reconcile trust against a requested id set. Returns the trusted ids.
    pub fn update_trusted_users(&mut self, ids: &[ParticipantId], changed_by: &str) -> Vec<ParticipantId> {
        let mut changed = Vec::new();
        for c in &mut self.clients {
            let trusted = ids.contains(&c.id);
            if trusted != c.trusted {
                c.trusted = trusted;
                changed.push((c.id, trusted));
            }
        }

        for (id, trusted) in changed {
            self.announce_trust_change(id, trusted, changed_by);
        }

        self.clients
            .iter()
            .filter(|c| c.trusted)
            .map(|c| c.id)
            .collect()
    }

    pub fn change_trusted_status(&mut self, id: ParticipantId, trusted: bool, changed_by: &str) {
        let changed = match self.client_mut(id) {
            Some(c) if c.trusted != trusted => {
                c.trusted = trusted;
                true
            }
            _ => false,
        };
        if changed {
            self.announce_trust_change(id, trusted, changed_by);
        }

        let ids = self
            .clients
            .iter()
            .filter(|c| c.trusted)
            .map(|c| c.id)
            .collect();
        self.add_to_history(Envelope::trusted_users(SERVER_CONTEXT, ids));
    }

    /// Promote the longest-connected member if nobody is an operator and
    /// there is no other way to become one.
    pub fn ensure_operator_exists(&mut self) {
        if self.history.has_opword() || self.history.has_auth_ops() {
            return;
        }

        if self.clients.iter().any(ClientConnection::is_operator) {
            return;
        }

        if let Some(first) = self.clients.first().map(|c| c.id) {
            self.change_op_status(first, true, "the server");
        }
    }

    /// Trusted non-operator in a session with deputies enabled.
    pub fn is_deputy(&self, id: ParticipantId) -> bool {
        self.client(id)
            .is_some_and(|c| !c.is_operator() && c.trusted && self.history.flags().deputies)
    }

    // ========================================================================
    // Bans and Mutes
    // ========================================================================

    pub fn add_ban(&mut self, target: ParticipantId, banned_by: &str) {
        let Some(c) = self.client(target) else { return };
        let (username, peer, ext) = (c.info.username.clone(), c.info.peer, c.info.ext_auth_id.clone());

        if self.history.bans_mut().add_ban(&username, peer, &ext, banned_by, 0) > 0 {
            self.log_user(target, Level::Info, Topic::Ban, format!("Banned by {banned_by}"));
            self.send_updated_banlist();
        }
    }

    pub fn remove_ban(&mut self, entry_id: u32, removed_by: &str) {
        if let Some(unbanned) = self.history.bans_mut().remove_ban(entry_id) {
            self.log(LogEntry::new(
                Level::Info,
                Topic::Unban,
                format!("{unbanned} unbanned by {removed_by}"),
            ));
            self.send_updated_banlist();
        }
    }

    pub fn set_muted(&mut self, target: ParticipantId, muted: bool, changed_by: &str) {
        let Some(c) = self.client_mut(target) else { return };
        if c.muted == muted {
            return;
        }
        c.muted = muted;

        let (topic, msg) = if muted {
            (Topic::Mute, format!("Muted by {changed_by}"))
        } else {
            (Topic::Unmute, format!("Unmuted by {changed_by}"))
        };
        self.log_user(target, Level::Info, topic, msg);
        self.send_updated_mute_list();
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    pub fn set_closed(&mut self, closed: bool) {
        if self.closed != closed {
            self.closed = closed;
            self.send_updated_session_properties();
        }
    }

    pub fn set_auth_only(&mut self, auth_only: bool) {
        if self.auth_only != auth_only {
            self.auth_only = auth_only;
            self.send_updated_session_properties();
        }
    }

    pub fn check_password(&self, password: &str) -> bool {
        !self.history.has_password() || password::check(password, self.history.password_hash())
    }

    pub fn set_password(&mut self, password: &str) {
        self.history.set_password_hash(password::hash(password));
    }

    /// Apply a partial configuration object. Unknown keys are ignored.
    ///
    /// `changed_by` is the member making the change, or `None` for the
    /// server administrator.
    pub fn set_session_config(&mut self, conf: &Map<String, Value>, changed_by: Option<ParticipantId>) {
        let mut changes: Vec<&str> = Vec::new();
        let flag = |key: &str| conf.get(key).map(|v| v.as_bool().unwrap_or(false));

        if let Some(closed) = flag("closed") {
            self.closed = closed;
            changes.push(if closed { "closed" } else { "opened" });
        }

        if let Some(auth_only) = flag("authOnly") {
            // Guests could lock themselves out otherwise
            let changer_authenticated = match changed_by {
                Some(id) => self.client(id).is_some_and(|c| c.info.authenticated),
                None => true,
            };
            if !auth_only || changer_authenticated {
                self.auth_only = auth_only;
                changes.push(if auth_only {
                    "blocked guest logins"
                } else {
                    "permitted guest logins"
                });
            }
        }

        let mut flags = self.history.flags();

        if let Some(persistent) = flag("persistent") {
            flags.persistent = persistent && self.config.enable_persistence;
            changes.push(if persistent {
                "made persistent"
            } else {
                "made nonpersistent"
            });
        }

        if let Some(title) = conf.get("title") {
            self.history.set_title(title.as_str().unwrap_or_default());
            changes.push("changed title");
        }

        if let Some(max) = conf.get("maxUserCount").and_then(Value::as_u64) {
            self.history
                .set_max_users(u32::try_from(max).unwrap_or(u32::MAX));
            changes.push("changed max. user count");
        }

        if let Some(threshold) = conf.get("resetThreshold").and_then(Value::as_u64) {
            self.history.set_autoreset_threshold(threshold);
            self.autoreset_state = AutoResetState::NotSent;
            changes.push("changed autoreset threshold");
        }

        if let Some(pw) = conf.get("password") {
            self.set_password(pw.as_str().unwrap_or_default());
            changes.push("changed password");
        }

        if let Some(opword) = conf.get("opword") {
            self.history
                .set_opword_hash(password::hash(opword.as_str().unwrap_or_default()));
            changes.push("changed opword");
        }

        // Only relayed: tells clients whether to record chat by default
        if let Some(preserve) = flag("preserveChat") {
            flags.preserve_chat = preserve;
            changes.push(if preserve {
                "preserve chat"
            } else {
                "don't preserve chat"
            });
        }

        if let Some(nsfm) = flag("nsfm") {
            flags.nsfm = nsfm;
            changes.push(if nsfm {
                "tagged NSFM"
            } else {
                "removed NSFM tag"
            });
        }

        if let Some(deputies) = flag("deputies") {
            flags.deputies = deputies;
            changes.push(if deputies {
                "enabled deputies"
            } else {
                "disabled deputies"
            });
        }

        self.history.set_flags(flags);

        if changes.is_empty() {
            return;
        }

        self.send_updated_session_properties();

        let summary = capitalize(&changes.join(", "));
        match changed_by {
            Some(id) => self.log_user(id, Level::Info, Topic::Status, summary),
            None => self.log(LogEntry::new(Level::Info, Topic::Status, summary)),
        }
    }

    /// Flat session configuration object as sent in `sessionconf` replies.
    pub fn session_config(&self) -> Value {
        let flags = self.history.flags();
        json!({
            "closed": self.closed,
            "authOnly": self.auth_only,
            "persistent": flags.persistent,
            "title": self.history.title(),
            "maxUserCount": self.history.max_users(),
            "resetThreshold": self.history.autoreset_threshold(),
            "resetThresholdBase": self.history.autoreset_threshold_base(),
            "preserveChat": flags.preserve_chat,
            "nsfm": flags.nsfm,
            "deputies": flags.deputies,
            "hasPassword": self.history.has_password(),
            "hasOpword": self.history.has_opword(),
        })
    }

    // ========================================================================
    // Broadcasts
    // ========================================================================

    /// Record the current configuration in history.
    pub fn send_updated_session_properties(&mut self) {
        let reply = ServerReply::new(ReplyKind::SessionConf, "").with("config", self.session_config());
        self.add_to_history(Envelope::reply(&reply));
        self.events.push(SessionEvent::AttributesChanged {
            session: self.id().to_string(),
        });
    }

    /// Moderators and local users see addresses, everyone else doesn't.
    pub fn send_updated_banlist(&mut self) {
        let version = |show_ip: bool, bans: &tandem_history::BanList| {
            Envelope::reply(
                &ServerReply::new(ReplyKind::SessionConf, "")
                    .with("config", json!({ "banlist": bans.to_json(show_ip) })),
            )
        };
        let public = version(false, self.history.bans());
        let private = version(true, self.history.bans());

        for c in &mut self.clients {
            let privileged = c.info.moderator || c.info.peer.is_some_and(|ip: IpAddr| ip.is_loopback());
            c.outbox
                .push_back(if privileged { private.clone() } else { public.clone() });
        }
    }

    pub fn send_updated_mute_list(&mut self) {
        let muted: Vec<_> = self
            .clients
            .iter()
            .filter(|c| c.muted)
            .map(|c| c.id)
            .collect();
        let reply =
            ServerReply::new(ReplyKind::SessionConf, "").with("config", json!({ "muted": muted }));
        self.direct_to_all(Envelope::reply(&reply));
    }

    /// Send to every member, bypassing history.
    pub fn direct_to_all(&mut self, msg: Envelope) {
        for c in &mut self.clients {
            c.outbox.push_back(msg.clone());
        }
    }

    /// Send a server chat line or alert to every member.
    pub fn message_all(&mut self, message: &str, alert: bool) {
        if message.is_empty() {
            return;
        }
        let kind = if alert { ReplyKind::Alert } else { ReplyKind::Message };
        self.direct_to_all(Envelope::reply(&ServerReply::new(kind, message)));
    }

    // ========================================================================
    // Recording
    // ========================================================================

    /// Set (or clear) the recording path. Recording starts the next time the
    /// session enters Running, or right away if it already is.
    pub fn set_recording_file(&mut self, path: Option<PathBuf>) {
        self.recording_file = path;
        match self.recording_file {
            Some(_) if self.state == SessionState::Running => self.restart_recording(),
            Some(_) => {}
            None => self.stop_recording(),
        }
    }

    pub fn restart_recording(&mut self) {
        self.stop_recording();

        let Some(base) = &self.recording_file else { return };
        let path = make_filename_unique(base);
        debug!(session = %self.id(), path = %path.display(), "starting session recording");

        let mut recorder = match RecordingWriter::create(&path) {
            Ok(r) => r,
            Err(e) => {
                warn!(session = %self.id(), path = %path.display(), error = %e, "couldn't write session recording");
                return;
            }
        };

        let header = json!({
            "server-recording": true,
            "version": self.config.protocol_version,
        });
        if let Err(e) = self.write_recording_start(&mut recorder, &header) {
            warn!(session = %self.id(), path = %path.display(), error = %e, "couldn't write session recording");
            return;
        }

        self.recorder = Some(recorder);
    }

    fn write_recording_start(
        &mut self,
        recorder: &mut RecordingWriter,
        header: &Value,
    ) -> std::io::Result<()> {
        recorder.write_header(header)?;
        recorder.set_autoflush(true);

        let end = self.history.end_index();
        let mut pos = self.history.first_index();
        while pos < end {
            let batch = self
                .history
                .get_batch(pos)
                .map_err(std::io::Error::other)?;
            if batch.messages.is_empty() {
                break;
            }
            for msg in &batch.messages {
                recorder.record_message(msg)?;
            }
            pos = batch.next;
        }
        recorder.flush()
    }

    pub fn stop_recording(&mut self) {
        if let Some(recorder) = self.recorder.take()
            && let Err(e) = recorder.close()
        {
            warn!(session = %self.id(), error = %e, "error closing session recording");
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("closed, changed title"), "Closed, changed title");
        assert_eq!(capitalize(""), "");
    }
}
