//! Public session listings.
//!
//! Talking to a listing server is asynchronous, so the session never does it
//! directly: it queues an [`ExternalRequest`], the driver executes it with an
//! injected [`ListingClient`] and feeds the [`ExternalOutcome`] back.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tandem_wire::{Envelope, ReplyKind, ServerReply};

use crate::error::{ListingError, ReportError};
use crate::log::{Level, LogEntry, Topic};
use crate::report::{AbuseReport, ReportClient};
use crate::session::Session;

/// A listing the session holds at one listing server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub api_url: String,
    pub listing_id: i64,
    pub roomcode: String,
    pub is_private: bool,
    /// Minutes between refreshes the server asked for. Zero means none.
    pub refresh_interval_mins: u32,
}

/// Session info as sent to a listing server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingSession {
    pub host: String,
    pub port: u16,
    pub id: String,
    pub protocol: String,
    pub title: String,
    pub users: usize,
    pub usernames: Vec<String>,
    pub password: bool,
    pub nsfm: bool,
    pub private: bool,
    pub owner: String,
    pub started: DateTime<Utc>,
}

/// A successful announcement.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingAnnounced {
    pub announcement: Announcement,
    /// Optional welcome text from the listing server.
    pub message: Option<String>,
}

#[async_trait]
pub trait ListingClient: Send + Sync {
    async fn announce(
        &self,
        api_url: &str,
        session: &ListingSession,
    ) -> Result<ListingAnnounced, ListingError>;

    /// Returns an optional message from the listing server.
    async fn refresh(
        &self,
        listing: &Announcement,
        session: &ListingSession,
    ) -> Result<Option<String>, ListingError>;

    async fn unlist(&self, listing: &Announcement) -> Result<(), ListingError>;
}

/// Outbound call queued by a session.
#[derive(Debug, Clone)]
pub enum ExternalRequest {
    Announce {
        api_url: String,
        session: ListingSession,
    },
    Refresh {
        listing: Announcement,
        session: ListingSession,
    },
    Unlist {
        listing: Announcement,
    },
    Report {
        url: String,
        token: Option<String>,
        report: AbuseReport,
    },
}

/// Result of an [`ExternalRequest`], delivered back to the session.
#[derive(Debug, Clone)]
pub enum ExternalOutcome {
    Announced {
        api_url: String,
        result: Result<ListingAnnounced, ListingError>,
    },
    Refreshed {
        api_url: String,
        result: Result<Option<String>, ListingError>,
    },
    Unlisted {
        api_url: String,
        result: Result<(), ListingError>,
    },
    ReportSent {
        result: Result<(), ReportError>,
    },
}

impl ExternalRequest {
    /// Perform the call. A missing client fails the request.
    pub async fn execute(
        self,
        listing: Option<Arc<dyn ListingClient>>,
        reports: Option<Arc<dyn ReportClient>>,
    ) -> ExternalOutcome {
        let no_client = || ListingError::Http("no listing client configured".to_string());

        match self {
            Self::Announce { api_url, session } => {
                let result = match &listing {
                    Some(client) => client.announce(&api_url, &session).await,
                    None => Err(no_client()),
                };
                ExternalOutcome::Announced { api_url, result }
            }
            Self::Refresh { listing: l, session } => {
                let result = match &listing {
                    Some(client) => client.refresh(&l, &session).await,
                    None => Err(no_client()),
                };
                ExternalOutcome::Refreshed {
                    api_url: l.api_url,
                    result,
                }
            }
            Self::Unlist { listing: l } => {
                let result = match &listing {
                    Some(client) => client.unlist(&l).await,
                    None => Err(no_client()),
                };
                ExternalOutcome::Unlisted {
                    api_url: l.api_url,
                    result,
                }
            }
            Self::Report { url, token, report } => {
                let result = match &reports {
                    Some(client) => client.send_report(&url, token.as_deref(), &report).await,
                    None => Err(ReportError::NotConfigured),
                };
                ExternalOutcome::ReportSent { result }
            }
        }
    }
}

impl Session {
    pub fn listings(&self) -> &[Announcement] {
        &self.listings
    }

    /// When the listings are next due for a refresh.
    pub fn refresh_deadline(&self) -> Option<Instant> {
        self.refresh_at
    }

    /// Outbound calls queued since the last call.
    pub fn take_requests(&mut self) -> Vec<ExternalRequest> {
        std::mem::take(&mut self.requests)
    }

    pub(crate) fn listing_session(&self, private: bool) -> ListingSession {
        let hide_names = self.history.has_password() || self.config.private_user_list;
        ListingSession {
            host: self.config.local_hostname.clone(),
            port: self.config.announce_port,
            id: self.history.id_or_alias().to_string(),
            protocol: self.config.protocol_version.clone(),
            title: self.history.title().to_string(),
            users: self.clients.len(),
            usernames: if hide_names { Vec::new() } else { self.user_names() },
            password: self.history.has_password(),
            nsfm: self.history.flags().nsfm,
            private,
            owner: self.history.founder().to_string(),
            started: self.history.start_time(),
        }
    }

    /// List the session at a listing server.
    ///
    /// Announcing again at the same server only updates the privacy setting.
    pub fn make_announcement(&mut self, api_url: &str, private: bool) {
        if !self.config.is_allowed_announcement_url(api_url) {
            self.log(LogEntry::new(
                Level::Warn,
                Topic::PubList,
                format!("Announcement API URL not allowed: {api_url}"),
            ));
            return;
        }

        if let Some(existing) = self.listings.iter_mut().find(|l| l.api_url == api_url) {
            if existing.is_private != private {
                existing.is_private = private;
                if private {
                    self.history.remove_announcement(api_url);
                } else {
                    self.history.add_announcement(api_url);
                }
                self.send_updated_announcement_list();
                // Push the change on the next tick
                self.refresh_at = Some(Instant::now());
            }
            return;
        }

        self.log(LogEntry::new(
            Level::Info,
            Topic::PubList,
            format!("Announcing session at {api_url}"),
        ));
        self.requests.push(ExternalRequest::Announce {
            api_url: api_url.to_string(),
            session: self.listing_session(private),
        });
    }

    /// Remove a listing, or all of them with `"*"`.
    ///
    /// With `remove_only` the listing is forgotten without contacting the
    /// listing server. With `terminate` the listing is also dropped from the
    /// persisted announcement list, so it isn't announced again on restore.
    pub fn unlist_announcement(&mut self, api_url: &str, terminate: bool, remove_only: bool) {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.listings)
            .into_iter()
            .partition(|l| api_url == "*" || l.api_url == api_url);
        self.listings = kept;

        if removed.is_empty() {
            return;
        }

        for listing in removed {
            if !remove_only {
                self.requests.push(ExternalRequest::Unlist {
                    listing: listing.clone(),
                });
            }
            if terminate {
                self.history.remove_announcement(&listing.api_url);
            }
            self.log(LogEntry::new(
                Level::Info,
                Topic::PubList,
                format!("Unlisted from {}", listing.api_url),
            ));
        }

        self.send_updated_announcement_list();
    }

    /// Refresh every listing and schedule the next round.
    pub fn refresh_announcements(&mut self) {
        let mut interval_mins = 0;
        for listing in &self.listings {
            interval_mins = interval_mins.max(listing.refresh_interval_mins);
        }

        let requests: Vec<_> = self
            .listings
            .iter()
            .map(|l| ExternalRequest::Refresh {
                listing: l.clone(),
                session: self.listing_session(l.is_private),
            })
            .collect();
        self.requests.extend(requests);

        self.refresh_at = (interval_mins > 0)
            .then(|| Instant::now() + Duration::from_secs(u64::from(interval_mins) * 60));
    }

    pub fn send_updated_announcement_list(&mut self) {
        let list: Vec<_> = self
            .listings
            .iter()
            .map(|l| {
                json!({
                    "url": l.api_url,
                    "roomcode": l.roomcode,
                    "private": l.is_private,
                })
            })
            .collect();
        let reply = ServerReply::new(ReplyKind::SessionConf, "")
            .with("config", json!({ "announcements": list }));
        self.direct_to_all(Envelope::reply(&reply));
    }

    /// Apply the result of a request queued earlier.
    pub fn handle_external_outcome(&mut self, outcome: ExternalOutcome) {
        match outcome {
            ExternalOutcome::Announced { api_url, result } => match result {
                Ok(announced) => self.announcement_added(announced),
                Err(e) => {
                    self.log(LogEntry::new(
                        Level::Warn,
                        Topic::PubList,
                        format!("{api_url}: announcement failed: {e}"),
                    ));
                    self.message_all(&e.to_string(), false);
                }
            },
            ExternalOutcome::Refreshed { api_url, result } => match result {
                Ok(Some(message)) => self.message_all(&message, false),
                Ok(None) => {}
                Err(e) => {
                    self.log(LogEntry::new(
                        Level::Warn,
                        Topic::PubList,
                        format!("{api_url}: refresh failed: {e}"),
                    ));
                    // The listing server has most likely expired the listing
                    self.unlist_announcement(&api_url, true, true);
                    self.message_all(&e.to_string(), false);
                }
            },
            ExternalOutcome::Unlisted { api_url, result } => {
                if let Err(e) = result {
                    self.log(LogEntry::new(
                        Level::Warn,
                        Topic::PubList,
                        format!("{api_url}: unlisting failed: {e}"),
                    ));
                }
            }
            ExternalOutcome::ReportSent { result } => {
                if let Err(e) = result {
                    self.log(LogEntry::new(Level::Warn, Topic::Status, e.to_string()));
                }
            }
        }
    }

    fn announcement_added(&mut self, announced: ListingAnnounced) {
        let ListingAnnounced {
            announcement,
            message,
        } = announced;

        if let Some(message) = message.filter(|m| !m.is_empty()) {
            self.message_all(&message, false);
        }

        if self.listings.iter().any(|l| l.api_url == announcement.api_url) {
            self.log(LogEntry::new(
                Level::Warn,
                Topic::PubList,
                format!("Double announcement at {}", announcement.api_url),
            ));
            return;
        }

        self.log(LogEntry::new(
            Level::Info,
            Topic::PubList,
            format!(
                "Announced at {} (room code {})",
                announcement.api_url, announcement.roomcode
            ),
        ));

        if !announcement.is_private {
            self.history.add_announcement(&announcement.api_url);
        }

        if announcement.refresh_interval_mins > 0 {
            let due = Instant::now()
                + Duration::from_secs(u64::from(announcement.refresh_interval_mins) * 60);
            self.refresh_at = Some(self.refresh_at.map_or(due, |at| at.min(due)));
        }

        self.listings.push(announcement);
        self.send_updated_announcement_list();
    }

    /// Report a member (or the whole session when `about` is `None`) to the
    /// abuse report server.
    pub fn send_abuse_report(
        &mut self,
        reporter: tandem_wire::ParticipantId,
        about: Option<tandem_wire::ParticipantId>,
        message: &str,
    ) {
        let Some(reporter_conn) = self.client(reporter) else {
            return;
        };
        let reporter_info = reporter_conn.info.clone();

        let subject = about.map_or_else(|| "the session".to_string(), |id| format!("user #{id}"));
        self.log_user(
            reporter,
            Level::Info,
            Topic::Status,
            format!("Abuse report about {subject} received: {message}"),
        );

        let Some(url) = self.config.report_url.clone() else {
            self.log(LogEntry::new(
                Level::Warn,
                Topic::Status,
                "Cannot send abuse report: server URL not configured!",
            ));
            return;
        };

        let report = AbuseReport::new(self, &reporter_info, about, message);
        self.requests.push(ExternalRequest::Report {
            url,
            token: Some(self.config.report_token.clone()).filter(|t| !t.is_empty()),
            report,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticListing;

    #[async_trait]
    impl ListingClient for StaticListing {
        async fn announce(
            &self,
            api_url: &str,
            _session: &ListingSession,
        ) -> Result<ListingAnnounced, ListingError> {
            Ok(ListingAnnounced {
                announcement: Announcement {
                    api_url: api_url.to_string(),
                    listing_id: 7,
                    roomcode: "ABCDE".into(),
                    is_private: false,
                    refresh_interval_mins: 5,
                },
                message: None,
            })
        }

        async fn refresh(
            &self,
            _listing: &Announcement,
            _session: &ListingSession,
        ) -> Result<Option<String>, ListingError> {
            Err(ListingError::Rejected("expired".into()))
        }

        async fn unlist(&self, _listing: &Announcement) -> Result<(), ListingError> {
            Ok(())
        }
    }

    fn listing_session() -> ListingSession {
        ListingSession {
            host: "localhost".into(),
            port: 27750,
            id: "abc".into(),
            protocol: "tandem:4.21.2".into(),
            title: String::new(),
            users: 0,
            usernames: Vec::new(),
            password: false,
            nsfm: false,
            private: false,
            owner: "alice".into(),
            started: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_execute_announce() {
        let request = ExternalRequest::Announce {
            api_url: "https://list.example/api/".into(),
            session: listing_session(),
        };
        let outcome = request.execute(Some(Arc::new(StaticListing)), None).await;
        match outcome {
            ExternalOutcome::Announced { api_url, result } => {
                assert_eq!(api_url, "https://list.example/api/");
                assert_eq!(result.unwrap().announcement.roomcode, "ABCDE");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_execute_without_client_fails() {
        let request = ExternalRequest::Announce {
            api_url: "https://list.example/api/".into(),
            session: listing_session(),
        };
        match request.execute(None, None).await {
            ExternalOutcome::Announced { result, .. } => assert!(result.is_err()),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    const LIST_URL: &str = "https://list.example/api/";

    fn announced_session() -> Session {
        let mut session = Session::new(
            tandem_history::HistoryStore::new("abc", "alice"),
            Arc::new(crate::config::ServerConfig::default()),
        );
        session.handle_external_outcome(ExternalOutcome::Announced {
            api_url: LIST_URL.into(),
            result: Ok(ListingAnnounced {
                announcement: Announcement {
                    api_url: LIST_URL.into(),
                    listing_id: 7,
                    roomcode: "ABCDE".into(),
                    is_private: false,
                    refresh_interval_mins: 5,
                },
                message: None,
            }),
        });
        assert_eq!(session.listings().len(), 1);
        assert_eq!(session.history().announcements(), [LIST_URL.to_string()]);
        session
    }

    /// Unloading a session keeps its public listings for the next restore.
    #[test]
    fn test_unload_keeps_persisted_listing() {
        let mut session = announced_session();
        session.kill_session(false);

        assert!(session.listings().is_empty());
        assert_eq!(session.history().announcements(), [LIST_URL.to_string()]);
        assert!(
            session
                .take_requests()
                .iter()
                .any(|r| matches!(r, ExternalRequest::Unlist { .. }))
        );
    }

    /// A listing that failed to refresh is forgotten for good.
    #[test]
    fn test_refresh_failure_drops_persisted_listing() {
        let mut session = announced_session();
        session.handle_external_outcome(ExternalOutcome::Refreshed {
            api_url: LIST_URL.into(),
            result: Err(ListingError::Rejected("expired".into())),
        });

        assert!(session.listings().is_empty());
        assert!(session.history().announcements().is_empty());
        // Already gone on the server side
        assert!(
            !session
                .take_requests()
                .iter()
                .any(|r| matches!(r, ExternalRequest::Unlist { .. }))
        );
    }

    /// An explicit unlist contacts the server and forgets the listing.
    #[test]
    fn test_explicit_unlist_drops_persisted_listing() {
        let mut session = announced_session();
        session.unlist_announcement(LIST_URL, true, false);

        assert!(session.listings().is_empty());
        assert!(session.history().announcements().is_empty());
        assert!(
            session
                .take_requests()
                .iter()
                .any(|r| matches!(r, ExternalRequest::Unlist { .. }))
        );
    }

    #[test]
    fn test_listing_session_is_camel_case() {
        let value = serde_json::to_value(listing_session()).unwrap();
        assert!(value.get("usernames").is_some());
        assert_eq!(value["owner"], "alice");
    }
}
