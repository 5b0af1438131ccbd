//! Client commands (`Command` envelopes carrying JSON).

use serde_json::Value;
use tandem_wire::{DisconnectReason, Envelope, ParticipantId, ServerCommand, ServerReply};

use crate::error::CommandError;
use crate::log::{Level, Topic};
use crate::password;
use crate::session::Session;

fn arg_str<'a>(cmd: &'a ServerCommand, index: usize) -> Result<&'a str, CommandError> {
    cmd.args
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| CommandError::BadArguments(format!("expected a string at position {index}")))
}

fn arg_id(cmd: &ServerCommand, index: usize) -> Result<ParticipantId, CommandError> {
    cmd.args
        .get(index)
        .and_then(Value::as_u64)
        .and_then(|id| ParticipantId::try_from(id).ok())
        .ok_or_else(|| CommandError::BadArguments(format!("expected a user id at position {index}")))
}

fn kwarg_bool(cmd: &ServerCommand, key: &str) -> bool {
    cmd.kwargs.get(key).and_then(Value::as_bool).unwrap_or(false)
}

impl Session {
    /// Run a command sent by `from`. Failures are reported back to the
    /// sender and logged as rule breaks.
    pub fn handle_server_command(&mut self, from: ParticipantId, cmd: ServerCommand) {
        if let Err(e) = self.dispatch_command(from, &cmd) {
            self.log_user(
                from,
                Level::Warn,
                Topic::RuleBreak,
                format!("{}: {e}", cmd.cmd),
            );
            self.send_direct(from, Envelope::reply(&ServerReply::error(e.to_string())));
        }
    }

    fn dispatch_command(&mut self, from: ParticipantId, cmd: &ServerCommand) -> Result<(), CommandError> {
        match cmd.cmd.as_str() {
            "init-begin" => self.handle_init_begin(from),
            "init-complete" => self.handle_init_complete(from),
            "init-cancel" => self.handle_init_cancel(from),
            "ready-to-autoreset" => self.ready_to_auto_reset(from),

            "reset-session" => {
                self.require_op(from)?;
                self.reset_session(from)?;
            }

            "sessionconf" => {
                self.require_op(from)?;
                self.set_session_config(&cmd.kwargs, Some(from));
            }

            "kick-user" => self.kick_user(from, cmd)?,

            "remove-ban" => {
                let by = self.require_op(from)?;
                let entry = cmd
                    .args
                    .first()
                    .and_then(Value::as_u64)
                    .and_then(|id| u32::try_from(id).ok())
                    .ok_or_else(|| CommandError::BadArguments("expected a ban entry id".into()))?;
                self.remove_ban(entry, &by);
            }

            "mute" => {
                let by = self.require_op(from)?;
                let target = arg_id(cmd, 0)?;
                let muted = cmd
                    .args
                    .get(1)
                    .and_then(Value::as_bool)
                    .ok_or_else(|| CommandError::BadArguments("expected mute state".into()))?;
                if self.client(target).is_none() {
                    return Err(CommandError::UnknownUser(target));
                }
                self.set_muted(target, muted, &by);
            }

            "announce-session" => {
                self.require_op(from)?;
                let url = arg_str(cmd, 0)?;
                self.make_announcement(url, kwarg_bool(cmd, "private"));
            }

            "unlist-session" => {
                self.require_op(from)?;
                let url = arg_str(cmd, 0)?;
                self.unlist_announcement(url, true, false);
            }

            "gain-op" => {
                let opword = arg_str(cmd, 0)?;
                if !password::check(opword, self.history.opword_hash()) {
                    return Err(CommandError::IncorrectOpword);
                }
                self.change_op_status(from, true, "password");
            }

            "report" => {
                let reason = cmd
                    .kwargs
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let about = cmd
                    .kwargs
                    .get("user")
                    .and_then(Value::as_u64)
                    .and_then(|id| ParticipantId::try_from(id).ok());
                self.send_abuse_report(from, about, &reason);
            }

            other => return Err(CommandError::UnknownCommand(other.to_string())),
        }
        Ok(())
    }

    /// Returns the operator's name.
    fn require_op(&self, id: ParticipantId) -> Result<String, CommandError> {
        match self.client(id) {
            Some(c) if c.is_operator() => Ok(c.username().to_string()),
            _ => Err(CommandError::NotOperator),
        }
    }

    /// Operators may kick (and ban) anyone but moderators. Deputies may kick
    /// regular users.
    fn kick_user(&mut self, from: ParticipantId, cmd: &ServerCommand) -> Result<(), CommandError> {
        let target_id = arg_id(cmd, 0)?;
        let ban = kwarg_bool(cmd, "ban");

        let kicker = self.client(from).ok_or(CommandError::UnknownUser(from))?;
        let kicker_name = kicker.username().to_string();
        let kicker_is_op = kicker.is_operator();
        let kicker_is_deputy = self.is_deputy(from);

        if !kicker_is_op && !kicker_is_deputy {
            return Err(CommandError::NotOperator);
        }
        if target_id == from {
            return Err(CommandError::CannotKickSelf);
        }

        let target = self
            .client(target_id)
            .ok_or(CommandError::UnknownUser(target_id))?;
        if target.is_moderator() {
            return Err(CommandError::CannotKickModerator);
        }
        if !kicker_is_op && (ban || target.is_operator() || target.is_trusted()) {
            return Err(CommandError::NotOperator);
        }

        if ban {
            self.add_ban(target_id, &kicker_name);
        }
        self.disconnect(target_id, DisconnectReason::Kick, &kicker_name);
        Ok(())
    }
}
