//! Per-session actor.
//!
//! One tokio task owns each [`Session`]. Transports and the admin layer talk
//! to it through a cloneable [`SessionHandle`]; every command runs to
//! completion before the next one is taken, so session state is never
//! shared.
//!
//! Each joined connection registers an [`Outlet`]. After every command the
//! actor flushes queued messages to outlets as [`Outgoing::Batch`]; the
//! transport writes a batch and answers with [`SessionHandle::all_sent`],
//! which releases the next history batch for that connection.
//!
//! Participant ids are recycled, so transports address their member with the
//! [`ConnectionKey`] returned by [`SessionHandle::join`]. Commands carrying a
//! key from an earlier connection are dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tandem_wire::{Envelope, ParticipantId};
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep_until;
use tracing::{debug, info};

use crate::announce::{ExternalOutcome, ListingClient};
use crate::api::{JsonApiMethod, JsonApiResult};
use crate::client::ClientInfo;
use crate::error::{ActorError, JoinError};
use crate::events::SessionEvent;
use crate::report::ReportClient;
use crate::session::Session;

/// Command queue depth per session.
const COMMAND_BUFFER: usize = 256;

/// Services a session uses but doesn't own.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub listing: Option<Arc<dyn ListingClient>>,
    pub reports: Option<Arc<dyn ReportClient>>,
    pub events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

/// What a connection's transport receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Batch(Vec<Envelope>),
    /// Send nothing more and close the connection.
    Close,
}

pub type Outlet = mpsc::UnboundedSender<Outgoing>;

/// One joined connection. The serial is never reused within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    id: ParticipantId,
    serial: u64,
}

impl ConnectionKey {
    pub fn id(&self) -> ParticipantId {
        self.id
    }
}

pub enum SessionCmd {
    Join {
        info: ClientInfo,
        host: bool,
        outlet: Outlet,
        reply: oneshot::Sender<Result<ConnectionKey, JoinError>>,
    },
    Message {
        key: ConnectionKey,
        msg: Envelope,
    },
    AllSent {
        key: ConnectionKey,
    },
    Disconnected {
        key: ConnectionKey,
    },
    Api {
        method: JsonApiMethod,
        path: Vec<String>,
        request: Map<String, Value>,
        reply: oneshot::Sender<JsonApiResult>,
    },
    Description {
        full: bool,
        reply: oneshot::Sender<Value>,
    },
    Kill {
        terminate: bool,
        reply: oneshot::Sender<()>,
    },
}

// ============================================================================
// Handle
// ============================================================================

#[derive(Clone, Debug)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCmd>,
}

impl SessionHandle {
    async fn send(&self, cmd: SessionCmd) -> Result<(), ActorError> {
        self.tx.send(cmd).await.map_err(|_| ActorError::Closed)
    }

    /// Join the session. Messages for the new member arrive on `outlet`.
    pub async fn join(
        &self,
        info: ClientInfo,
        host: bool,
        outlet: Outlet,
    ) -> Result<ConnectionKey, ActorError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCmd::Join {
            info,
            host,
            outlet,
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| ActorError::Closed)??)
    }

    pub async fn message(&self, key: ConnectionKey, msg: Envelope) -> Result<(), ActorError> {
        self.send(SessionCmd::Message { key, msg }).await
    }

    /// The transport finished writing the last batch for `key`.
    pub async fn all_sent(&self, key: ConnectionKey) -> Result<(), ActorError> {
        self.send(SessionCmd::AllSent { key }).await
    }

    pub async fn disconnected(&self, key: ConnectionKey) -> Result<(), ActorError> {
        self.send(SessionCmd::Disconnected { key }).await
    }

    pub async fn api(
        &self,
        method: JsonApiMethod,
        path: Vec<String>,
        request: Map<String, Value>,
    ) -> Result<JsonApiResult, ActorError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCmd::Api {
            method,
            path,
            request,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ActorError::Closed)
    }

    pub async fn description(&self, full: bool) -> Result<Value, ActorError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCmd::Description { full, reply }).await?;
        rx.await.map_err(|_| ActorError::Closed)
    }

    /// Shut the session down and stop its actor.
    pub async fn kill(&self, terminate: bool) -> Result<(), ActorError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCmd::Kill { terminate, reply }).await?;
        rx.await.map_err(|_| ActorError::Closed)
    }
}

// ============================================================================
// Actor
// ============================================================================

struct SessionActor {
    session: Session,
    collaborators: Collaborators,
    rx: mpsc::Receiver<SessionCmd>,
    outcome_tx: mpsc::UnboundedSender<ExternalOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<ExternalOutcome>,
    outlets: HashMap<ParticipantId, LiveOutlet>,
    next_serial: u64,
}

struct LiveOutlet {
    serial: u64,
    outlet: Outlet,
}

/// Run a session on its own task.
pub fn spawn_session(session: Session, collaborators: Collaborators) -> SessionHandle {
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

    let actor = SessionActor {
        session,
        collaborators,
        rx,
        outcome_tx,
        outcome_rx,
        outlets: HashMap::new(),
        next_serial: 1,
    };
    tokio::spawn(actor.run());

    SessionHandle { tx }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

impl SessionActor {
    async fn run(mut self) {
        // Requests queued while the session was built (restored listings)
        self.flush();

        loop {
            let refresh = self.session.refresh_deadline();

            tokio::select! {
                cmd = self.rx.recv() => {
                    let Some(cmd) = cmd else {
                        break;
                    };
                    let keep_running = self.handle(cmd);
                    self.flush();
                    if !keep_running {
                        break;
                    }
                }
                Some(outcome) = self.outcome_rx.recv() => {
                    self.session.handle_external_outcome(outcome);
                    self.flush();
                }
                () = wait_until(refresh) => {
                    self.session.refresh_announcements();
                    self.flush();
                }
            }
        }

        debug!(session = %self.session.id(), "session actor stopped");
    }

    /// Returns false once the session is gone.
    fn handle(&mut self, cmd: SessionCmd) -> bool {
        match cmd {
            SessionCmd::Join {
                info,
                host,
                outlet,
                reply,
            } => {
                let result = self.session.join_user(info, host).map(|id| {
                    let serial = self.next_serial;
                    self.next_serial += 1;
                    self.outlets.insert(id, LiveOutlet { serial, outlet });
                    ConnectionKey { id, serial }
                });
                let _ = reply.send(result);
            }
            SessionCmd::Message { key, msg } => {
                if self.is_current(key) {
                    self.session.handle_client_message(key.id, msg);
                }
            }
            SessionCmd::AllSent { key } => {
                if self.is_current(key) {
                    self.session.all_sent(key.id);
                }
            }
            SessionCmd::Disconnected { key } => {
                if self.is_current(key) {
                    self.outlets.remove(&key.id);
                    self.session.client_disconnected(key.id);
                }
            }
            SessionCmd::Api {
                method,
                path,
                request,
                reply,
            } => {
                let result = self.session.call_json_api(method, &path, &request);
                let _ = reply.send(result);
            }
            SessionCmd::Description { full, reply } => {
                let _ = reply.send(self.session.description(full));
            }
            SessionCmd::Kill { terminate, reply } => {
                self.session.kill_session(terminate);
                info!(session = %self.session.id(), "session killed");
                self.flush();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn is_current(&self, key: ConnectionKey) -> bool {
        let current = self
            .outlets
            .get(&key.id)
            .is_some_and(|live| live.serial == key.serial);
        if !current {
            debug!(session = %self.session.id(), user = key.id, serial = key.serial, "command for a closed connection dropped");
        }
        current
    }

    /// Deliver everything the session queued.
    fn flush(&mut self) {
        // A dead outlet removes its member, which can queue more messages
        loop {
            let mut lost = Vec::new();
            for id in self.session.pending_outboxes() {
                let batch = self.session.take_outbox(id);
                let delivered = self
                    .outlets
                    .get(&id)
                    .is_some_and(|live| live.outlet.send(Outgoing::Batch(batch)).is_ok());
                if !delivered {
                    lost.push(id);
                }
            }
            if lost.is_empty() {
                break;
            }
            for id in lost {
                debug!(session = %self.session.id(), user = id, "outlet closed");
                self.outlets.remove(&id);
                self.session.client_disconnected(id);
            }
        }

        for (id, messages) in self.session.take_departed() {
            if let Some(LiveOutlet { outlet, .. }) = self.outlets.remove(&id) {
                if !messages.is_empty() {
                    let _ = outlet.send(Outgoing::Batch(messages));
                }
                let _ = outlet.send(Outgoing::Close);
            }
        }

        for request in self.session.take_requests() {
            let listing = self.collaborators.listing.clone();
            let reports = self.collaborators.reports.clone();
            let outcomes = self.outcome_tx.clone();
            tokio::spawn(async move {
                let outcome = request.execute(listing, reports).await;
                let _ = outcomes.send(outcome);
            });
        }

        let events = self.session.take_events();
        if let Some(observer) = &self.collaborators.events {
            for event in events {
                let _ = observer.send(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use tandem_history::HistoryStore;

    fn new_session() -> Session {
        Session::new(
            HistoryStore::new("s1", "alice"),
            Arc::new(ServerConfig::default()),
        )
    }

    fn alice() -> ClientInfo {
        ClientInfo {
            username: "alice".into(),
            ..Default::default()
        }
    }

    /// The host gets messages on its outlet and is closed on kill.
    #[tokio::test]
    async fn test_join_and_kill() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let handle = spawn_session(
            new_session(),
            Collaborators {
                events: Some(events_tx),
                ..Default::default()
            },
        );

        let (outlet, mut inbox) = mpsc::unbounded_channel();
        let key = handle.join(alice(), true, outlet).await.unwrap();
        assert_eq!(key.id(), 1);

        match inbox.recv().await {
            Some(Outgoing::Batch(messages)) => assert!(!messages.is_empty()),
            other => panic!("unexpected delivery: {other:?}"),
        }

        handle.kill(true).await.unwrap();
        loop {
            match inbox.recv().await {
                Some(Outgoing::Close) => break,
                Some(Outgoing::Batch(_)) => continue,
                None => panic!("outlet dropped without close"),
            }
        }

        assert!(matches!(
            events_rx.recv().await,
            Some(SessionEvent::UserConnected { user: 1, .. })
        ));
        assert_eq!(handle.description(false).await, Err(ActorError::Closed));
    }

    /// A second host is refused while the first is uploading.
    #[tokio::test]
    async fn test_second_host_rejected() {
        let handle = spawn_session(new_session(), Collaborators::default());

        let (outlet, _inbox) = mpsc::unbounded_channel();
        handle.join(alice(), true, outlet).await.unwrap();

        let (outlet, _inbox2) = mpsc::unbounded_channel();
        let bob = ClientInfo {
            username: "bob".into(),
            ..Default::default()
        };
        assert_eq!(
            handle.join(bob, true, outlet).await,
            Err(ActorError::Join(JoinError::NotInitializing))
        );
    }

    /// A late disconnect from a kicked connection leaves the member who
    /// rejoined under the same id alone.
    #[tokio::test]
    async fn test_stale_disconnect_ignored_after_rejoin() {
        let handle = spawn_session(new_session(), Collaborators::default());
        let bob = || ClientInfo {
            username: "bob".into(),
            ..Default::default()
        };

        let (outlet, _alice_inbox) = mpsc::unbounded_channel();
        handle.join(alice(), true, outlet).await.unwrap();

        let (outlet, _old_inbox) = mpsc::unbounded_channel();
        let old_bob = handle.join(bob(), false, outlet).await.unwrap();
        assert_eq!(old_bob.id(), 2);

        let kicked = handle
            .api(JsonApiMethod::Delete, vec!["2".into()], Map::new())
            .await
            .unwrap();
        assert_eq!(kicked, JsonApiResult::Ok(serde_json::json!({ "status": "ok" })));

        let (outlet, _new_inbox) = mpsc::unbounded_channel();
        let new_bob = handle.join(bob(), false, outlet).await.unwrap();
        assert_eq!(new_bob.id(), 2);
        assert_ne!(new_bob, old_bob);

        handle.disconnected(old_bob).await.unwrap();
        let description = handle.description(true).await.unwrap();
        assert_eq!(description["userCount"], 2);

        handle.disconnected(new_bob).await.unwrap();
        let description = handle.description(true).await.unwrap();
        assert_eq!(description["userCount"], 1);
    }

    #[tokio::test]
    async fn test_admin_description() {
        let handle = spawn_session(new_session(), Collaborators::default());
        let description = handle.description(true).await.unwrap();
        assert_eq!(description["id"], "s1");
        assert_eq!(description["userCount"], 0);
        assert!(description["users"].as_array().unwrap().is_empty());
    }
}
