//! Administrative JSON surface of a session.

use chrono::SecondsFormat;
use serde_json::{Map, Value, json};
use tandem_wire::{DisconnectReason, ParticipantId};

use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonApiMethod {
    Get,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JsonApiResult {
    Ok(Value),
    NotFound,
    BadMethod,
}

fn status_ok() -> JsonApiResult {
    JsonApiResult::Ok(json!({ "status": "ok" }))
}

impl Session {
    /// Session summary for admin views. `full` adds limits, members and
    /// listings.
    pub fn description(&self, full: bool) -> Value {
        let history = &self.history;
        let mut o = Map::new();
        o.insert("id".into(), json!(history.id()));
        o.insert("alias".into(), json!(history.alias()));
        o.insert("protocol".into(), json!(self.config.protocol_version));
        o.insert("userCount".into(), json!(self.clients.len()));
        o.insert("maxUserCount".into(), json!(history.max_users()));
        o.insert("founder".into(), json!(history.founder()));
        o.insert("title".into(), json!(history.title()));
        o.insert("hasPassword".into(), json!(history.has_password()));
        o.insert("closed".into(), json!(self.closed));
        o.insert("authOnly".into(), json!(self.auth_only));
        o.insert("nsfm".into(), json!(history.flags().nsfm));
        o.insert(
            "startTime".into(),
            json!(history.start_time().to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        o.insert("size".into(), json!(history.size_bytes()));
        if self.config.enable_persistence {
            o.insert("persistent".into(), json!(history.flags().persistent));
        }

        if full {
            o.insert("maxSize".into(), json!(history.size_limit()));
            o.insert(
                "resetThreshold".into(),
                json!(history.effective_autoreset_threshold()),
            );
            o.insert("deputies".into(), json!(history.flags().deputies));
            o.insert(
                "users".into(),
                Value::Array(self.clients.iter().map(|c| c.description()).collect()),
            );
            o.insert(
                "listings".into(),
                Value::Array(
                    self.listings
                        .iter()
                        .map(|l| {
                            json!({
                                "id": l.listing_id,
                                "url": l.api_url,
                                "roomcode": l.roomcode,
                                "private": l.is_private,
                            })
                        })
                        .collect(),
                ),
            );
        }

        Value::Object(o)
    }

    /// Handle an admin request for this session or a resource nested in it
    /// (`listing/<id>` or `<userId>`).
    pub fn call_json_api(
        &mut self,
        method: JsonApiMethod,
        path: &[String],
        request: &Map<String, Value>,
    ) -> JsonApiResult {
        match path {
            [] => self.session_api(method, request),
            [head, listing] if head == "listing" => self.listing_api(method, listing),
            [user] => match user.parse::<ParticipantId>() {
                Ok(id) => self.user_api(method, id, request),
                Err(_) => JsonApiResult::NotFound,
            },
            _ => JsonApiResult::NotFound,
        }
    }

    fn session_api(&mut self, method: JsonApiMethod, request: &Map<String, Value>) -> JsonApiResult {
        match method {
            JsonApiMethod::Get => {}
            JsonApiMethod::Update => {
                self.set_session_config(request, None);

                if let Some(message) = request.get("message").and_then(Value::as_str) {
                    self.message_all(message, false);
                }
                if let Some(alert) = request.get("alert").and_then(Value::as_str) {
                    self.message_all(alert, true);
                }
            }
            JsonApiMethod::Delete => {
                self.kill_session(true);
                return status_ok();
            }
        }
        JsonApiResult::Ok(self.description(true))
    }

    fn listing_api(&mut self, method: JsonApiMethod, listing: &str) -> JsonApiResult {
        let Ok(listing_id) = listing.parse::<i64>() else {
            return JsonApiResult::NotFound;
        };
        let Some(url) = self
            .listings
            .iter()
            .find(|l| l.listing_id == listing_id)
            .map(|l| l.api_url.clone())
        else {
            return JsonApiResult::NotFound;
        };

        match method {
            JsonApiMethod::Delete => {
                self.unlist_announcement(&url, true, false);
                status_ok()
            }
            JsonApiMethod::Get | JsonApiMethod::Update => JsonApiResult::BadMethod,
        }
    }

    fn user_api(
        &mut self,
        method: JsonApiMethod,
        id: ParticipantId,
        request: &Map<String, Value>,
    ) -> JsonApiResult {
        if self.client(id).is_none() {
            return JsonApiResult::NotFound;
        }

        match method {
            JsonApiMethod::Get => {}
            JsonApiMethod::Update => {
                if let Some(message) = request.get("message").and_then(Value::as_str) {
                    self.send_system_message(id, message);
                }
                if let Some(op) = request.get("op").and_then(Value::as_bool) {
                    self.change_op_status(id, op, "the server administrator");
                }
            }
            JsonApiMethod::Delete => {
                self.disconnect(id, DisconnectReason::Kick, "server operator");
                return status_ok();
            }
        }

        match self.client(id) {
            Some(c) => JsonApiResult::Ok(c.description()),
            None => JsonApiResult::NotFound,
        }
    }
}
