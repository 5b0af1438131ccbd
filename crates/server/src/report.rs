//! Abuse reports.

use async_trait::async_trait;
use serde::Serialize;
use tandem_wire::ParticipantId;

use crate::client::ClientInfo;
use crate::error::ReportError;
use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedUser {
    pub id: ParticipantId,
    pub name: String,
    pub auth: bool,
    pub op: bool,
    pub ip: String,
}

/// Report body posted to the abuse report server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AbuseReport {
    pub session: String,
    pub session_title: String,
    pub user: String,
    pub auth: bool,
    pub ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub perp: Option<ParticipantId>,
    pub message: String,
    /// History position at the time of the report.
    pub offset: u64,
    pub users: Vec<ReportedUser>,
}

impl AbuseReport {
    pub(crate) fn new(
        session: &Session,
        reporter: &ClientInfo,
        about: Option<ParticipantId>,
        message: &str,
    ) -> Self {
        let ip_of = |info: &ClientInfo| info.peer.map(|ip| ip.to_string()).unwrap_or_default();

        Self {
            session: session.id().to_string(),
            session_title: session.history().title().to_string(),
            user: reporter.username.clone(),
            auth: reporter.authenticated,
            ip: ip_of(reporter),
            perp: about,
            message: message.to_string(),
            offset: session.history().end_index(),
            users: session
                .clients()
                .iter()
                .map(|c| ReportedUser {
                    id: c.id(),
                    name: c.username().to_string(),
                    auth: c.info().authenticated,
                    op: c.is_operator(),
                    ip: ip_of(c.info()),
                })
                .collect(),
        }
    }
}

#[async_trait]
pub trait ReportClient: Send + Sync {
    async fn send_report(
        &self,
        url: &str,
        token: Option<&str>,
        report: &AbuseReport,
    ) -> Result<(), ReportError>;
}
