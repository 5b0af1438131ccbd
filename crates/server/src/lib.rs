//! Tandem Session Server
//!
//! The session server relays drawing messages between the members of a
//! shared canvas session. It owns:
//! - The session state machine (Initializing, Running, Resetting, ShuttingDown)
//! - Admission, id assignment and operator/trust privileges
//! - The ordered history log with size limits and reset
//! - Per-connection history catch-up with flow control
//! - Moderation (kick, ban, mute), the session log and recordings
//! - Public listing announcements and abuse reports
//!
//! # Architecture
//!
//! A [`Session`] is a synchronous state machine: every operation takes
//! `&mut self` and queues its output (per-connection outboxes, outbound HTTP
//! requests, observer events). [`actor::spawn_session`] runs one on a tokio
//! task and drains those queues after each command. Transports, listing
//! servers and report servers stay outside this crate.

#![deny(unsafe_code)]

pub mod actor;
pub mod announce;
pub mod api;
pub mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod log;
pub mod password;
pub mod report;
pub mod session;
pub mod state;

pub use actor::{Collaborators, ConnectionKey, Outgoing, Outlet, SessionHandle, spawn_session};
pub use announce::{Announcement, ExternalOutcome, ExternalRequest, ListingClient, ListingSession};
pub use api::{JsonApiMethod, JsonApiResult};
pub use client::{ClientConnection, ClientInfo};
pub use config::ServerConfig;
pub use error::{ActorError, CommandError, JoinError, ListingError, ReportError};
pub use events::SessionEvent;
pub use report::{AbuseReport, ReportClient};
pub use session::Session;
pub use state::{AutoResetState, SessionState};
