//! One-to-one call signaling.
//!
//! Every status change is a single conditional update on the call record, so
//! two racing signals (an accept and the ring timeout, say) cannot both win.
//! Chat-visible call messages go through an insert-if-absent on
//! `(conversation_id, call_id, call_status)`; a duplicate is absorbed and
//! produces no pushes.
//!
//! The ring timeout is a spawned task per call. It is aborted when the call
//! leaves `ringing`, but it re-checks the status through the same conditional
//! update, so a timer that slips through is harmless.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use courier_shared::constants::{MAX_PAGE_SIZE, PEER_TO_PEER_MAX_PARTICIPANTS};
use courier_shared::protocol::{MessagePayload, ServerEvent};
use courier_shared::types::{
    CallId, CallKind, CallMessageStatus, CallStatus, MessageKind, MessageStatus, UserId,
};
use courier_store::{stored_precision, CallRecord, CallTransition, DirectMessage, LastMessage};

use crate::conversations::{ConversationService, UnreadEffect};
use crate::dispatcher::Dispatcher;
use crate::error::ServerError;
use crate::store::Store;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteRequest {
    pub receiver_id: UserId,
    pub room_name: Option<String>,
    #[serde(default)]
    pub call_type: CallKind,
}

/// Call record as returned over HTTP.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSummary {
    pub call_id: CallId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub call_type: CallKind,
    pub room_name: String,
    pub max_participants: u32,
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration: Option<i64>,
    pub ended_by: Option<UserId>,
}

impl From<&CallRecord> for CallSummary {
    fn from(call: &CallRecord) -> Self {
        Self {
            call_id: call.call_id,
            caller_id: call.caller_id.clone(),
            callee_id: call.callee_id.clone(),
            call_type: call.call_kind,
            room_name: call.room_name.clone(),
            max_participants: call.max_participants,
            status: call.status,
            created_at: call.created_at,
            started_at: call.started_at,
            ended_at: call.ended_at,
            duration: call.duration_secs,
            ended_by: call.ended_by.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStats {
    #[serde(flatten)]
    pub call: CallSummary,
    /// Seconds so far for an accepted call, the recorded duration once ended.
    pub elapsed_secs: i64,
}

#[derive(Clone)]
pub struct CallEngine {
    inner: Arc<Inner>,
}

struct Inner {
    store: Store,
    conversations: ConversationService,
    dispatcher: Dispatcher,
    ring_timeout: Duration,
    timers: Mutex<HashMap<CallId, AbortHandle>>,
}

impl CallEngine {
    pub fn new(
        store: Store,
        conversations: ConversationService,
        dispatcher: Dispatcher,
        ring_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                conversations,
                dispatcher,
                ring_timeout,
                timers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub async fn invite(&self, caller: &UserId, req: InviteRequest) -> Result<CallRecord, ServerError> {
        if req.receiver_id.is_empty() {
            return Err(ServerError::invalid("receiverId is required"));
        }
        if &req.receiver_id == caller {
            return Err(ServerError::invalid("cannot call yourself"));
        }

        let now = stored_precision(Utc::now());
        let call_id = CallId::new();
        let room_name = req
            .room_name
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| format!("call-{call_id}"));

        let call = CallRecord {
            call_id,
            caller_id: caller.clone(),
            callee_id: req.receiver_id,
            call_kind: req.call_type,
            room_name,
            max_participants: PEER_TO_PEER_MAX_PARTICIPANTS,
            status: CallStatus::Ringing,
            created_at: now,
            started_at: None,
            ended_at: None,
            duration_secs: None,
            last_activity_at: now,
            ended_by: None,
            updated_at: now,
        };
        self.inner.store.run(|db| db.insert_call(&call))?;
        // Armed before anything else can fail, so a stored call always times out.
        self.arm_timer(call_id, self.inner.ring_timeout);

        self.note_call_message(&call, CallMessageStatus::Started, caller, None)
            .await;

        let dispatcher = &self.inner.dispatcher;
        dispatcher
            .push(
                &call.callee_id,
                ServerEvent::IncomingCall {
                    call_id,
                    caller_id: caller.clone(),
                    room_name: call.room_name.clone(),
                    call_type: call.call_kind,
                },
            )
            .await;
        dispatcher
            .push(
                caller,
                ServerEvent::InviteSent {
                    call_id,
                    callee_id: call.callee_id.clone(),
                    room_name: call.room_name.clone(),
                    status: CallStatus::Ringing,
                },
            )
            .await;

        info!(call = %call_id, caller = %caller, callee = %call.callee_id, kind = %call.call_kind, "Call invited");
        Ok(call)
    }

    pub async fn accept(&self, user: &UserId, call_id: &CallId) -> Result<CallRecord, ServerError> {
        let call = self.load(call_id)?;
        if &call.callee_id != user {
            return Err(ServerError::forbidden("only the callee can accept a call"));
        }
        if call.status == CallStatus::Accepted {
            return Ok(call);
        }
        self.require_ringing(&call)?;

        match self.apply(&call, CallStatus::Accepted, user, None, true).await? {
            Some(updated) => Ok(updated),
            None => self.settled_as(call_id, CallStatus::Accepted),
        }
    }

    pub async fn decline(&self, user: &UserId, call_id: &CallId) -> Result<CallRecord, ServerError> {
        let call = self.load(call_id)?;
        if &call.callee_id != user {
            return Err(ServerError::forbidden("only the callee can decline a call"));
        }
        if call.status == CallStatus::Declined {
            return Ok(call);
        }
        self.require_ringing(&call)?;

        match self.apply(&call, CallStatus::Declined, user, None, true).await? {
            Some(updated) => Ok(updated),
            None => self.settled_as(call_id, CallStatus::Declined),
        }
    }

    /// Ring timeout. Returns whether this call became `missed`.
    pub async fn expire(&self, call_id: &CallId) -> Result<bool, ServerError> {
        let call = self.load(call_id)?;
        if call.status != CallStatus::Ringing {
            self.take_timer(call_id);
            return Ok(false);
        }
        let caller = call.caller_id.clone();
        let won = self
            .apply(&call, CallStatus::Missed, &caller, None, false)
            .await?;
        Ok(won.is_some())
    }

    /// Either participant hangs up. From `ringing` this is a cancellation
    /// with zero duration.
    pub async fn end(&self, user: &UserId, call_id: &CallId) -> Result<CallRecord, ServerError> {
        // A concurrent transition can move the call between our read and the
        // conditional write; one re-read settles it.
        for _ in 0..2 {
            let call = self.load(call_id)?;
            if !call.is_participant(user) {
                return Err(ServerError::forbidden("not a participant of this call"));
            }
            match call.status {
                CallStatus::Ended => return Ok(call),
                CallStatus::Ringing | CallStatus::Accepted => {}
                other => {
                    return Err(ServerError::invalid(format!("call is already {other}")));
                }
            }
            if let Some(updated) = self.apply(&call, CallStatus::Ended, user, None, true).await? {
                return Ok(updated);
            }
        }
        let call = self.load(call_id)?;
        match call.status {
            CallStatus::Ended => Ok(call),
            other => Err(ServerError::invalid(format!("call is already {other}"))),
        }
    }

    /// Status observed outside the signaling channel, such as by the video
    /// room provider.
    pub async fn report_status(
        &self,
        user: &UserId,
        call_id: &CallId,
        status: CallStatus,
        duration: Option<i64>,
    ) -> Result<CallRecord, ServerError> {
        let call = self.load(call_id)?;
        if !call.is_participant(user) {
            return Err(ServerError::forbidden("not a participant of this call"));
        }
        if call.status == status {
            return Ok(call);
        }
        if !call.status.can_transition_to(status) {
            return Err(ServerError::invalid(format!(
                "cannot move a call from {} to {status}",
                call.status
            )));
        }
        if duration.is_some_and(|d| d < 0) {
            return Err(ServerError::invalid("duration must not be negative"));
        }

        match self.apply(&call, status, user, duration, true).await? {
            Some(updated) => Ok(updated),
            None => self.settled_as(call_id, status),
        }
    }

    pub fn history(
        &self,
        user: &UserId,
        before: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> Result<Vec<CallSummary>, ServerError> {
        let limit = limit.unwrap_or(20).clamp(1, MAX_PAGE_SIZE);
        let calls = self
            .inner
            .store
            .run(|db| db.calls_for_user(user, before.as_ref(), limit))?;
        Ok(calls.iter().map(CallSummary::from).collect())
    }

    pub fn stats(&self, user: &UserId, call_id: &CallId) -> Result<CallStats, ServerError> {
        let call = self.load(call_id)?;
        if !call.is_participant(user) {
            return Err(ServerError::forbidden("not a participant of this call"));
        }
        let elapsed_secs = match (call.status, call.started_at) {
            (CallStatus::Accepted, Some(started)) => (Utc::now() - started).num_seconds().max(0),
            _ => call.duration_secs.unwrap_or(0),
        };
        Ok(CallStats {
            call: CallSummary::from(&call),
            elapsed_secs,
        })
    }

    /// Re-arm ring timers for calls left ringing by a previous process.
    /// Calls whose timeout already passed are expired immediately.
    pub async fn recover_ringing(&self) -> Result<usize, ServerError> {
        let ringing = self
            .inner
            .store
            .run(|db| db.calls_with_status(CallStatus::Ringing))?;
        let count = ringing.len();
        let now = Utc::now();

        for call in ringing {
            let elapsed = (now - call.created_at).to_std().unwrap_or_default();
            match self.inner.ring_timeout.checked_sub(elapsed) {
                Some(remaining) if !remaining.is_zero() => self.arm_timer(call.call_id, remaining),
                _ => {
                    if let Err(e) = self.expire(&call.call_id).await {
                        warn!(call = %call.call_id, "Failed to expire stale call: {e}");
                    }
                }
            }
        }

        if count > 0 {
            info!(count, "Recovered ringing calls");
        }
        Ok(count)
    }

    // -- internals ---------------------------------------------------------

    fn load(&self, call_id: &CallId) -> Result<CallRecord, ServerError> {
        self.inner
            .store
            .run(|db| db.get_call(call_id))
            .map_err(|e| match e {
                ServerError::NotFound(_) => ServerError::not_found("call not found"),
                other => other,
            })
    }

    fn require_ringing(&self, call: &CallRecord) -> Result<(), ServerError> {
        if call.status == CallStatus::Ringing {
            Ok(())
        } else {
            Err(ServerError::invalid(format!("call is already {}", call.status)))
        }
    }

    /// After losing a conditional write: fine if someone else already moved
    /// the call to `wanted`, otherwise the call has moved on.
    fn settled_as(&self, call_id: &CallId, wanted: CallStatus) -> Result<CallRecord, ServerError> {
        let call = self.load(call_id)?;
        if call.status == wanted {
            Ok(call)
        } else {
            Err(ServerError::invalid(format!("call is already {}", call.status)))
        }
    }

    /// Conditionally move `call` from its observed status to `to`, then run
    /// the side effects of that transition. Returns `None` if another writer
    /// changed the call first.
    async fn apply(
        &self,
        call: &CallRecord,
        to: CallStatus,
        actor: &UserId,
        duration: Option<i64>,
        abort_timer: bool,
    ) -> Result<Option<CallRecord>, ServerError> {
        let now = stored_precision(Utc::now());
        let mut transition = CallTransition::new(to, &[call.status], now);
        match to {
            CallStatus::Accepted => transition.started_at = Some(now),
            CallStatus::Ended => {
                let measured = call
                    .started_at
                    .filter(|_| call.status == CallStatus::Accepted)
                    .map(|started| (now - started).num_seconds().max(0))
                    .unwrap_or(0);
                transition.duration_secs = Some(duration.unwrap_or(measured));
                transition.ended_at = Some(now);
                transition.ended_by = Some(actor.clone());
            }
            CallStatus::Declined | CallStatus::Missed => transition.ended_at = Some(now),
            CallStatus::Ringing => {}
        }

        let won = self
            .inner
            .store
            .run(|db| db.transition_call(&call.call_id, &transition))?;
        if !won {
            debug!(call = %call.call_id, from = %call.status, to = %to, "Call transition lost");
            return Ok(None);
        }

        if to != CallStatus::Ringing {
            if let Some(timer) = self.take_timer(&call.call_id) {
                if abort_timer {
                    timer.abort();
                }
            }
        }

        let updated = self.load(&call.call_id)?;
        self.announce(&updated, actor).await;
        info!(call = %call.call_id, from = %call.status, to = %to, actor = %actor, "Call transitioned");
        Ok(Some(updated))
    }

    /// Pushes for a transition that already won, then its chat message. A
    /// failed chat message is logged; the transition stands either way.
    async fn announce(&self, call: &CallRecord, actor: &UserId) {
        let dispatcher = &self.inner.dispatcher;
        let both = [&call.caller_id, &call.callee_id];
        match call.status {
            CallStatus::Ringing => {}
            CallStatus::Accepted => {
                dispatcher
                    .push_many(
                        both,
                        &ServerEvent::CallAccepted {
                            call_id: call.call_id,
                            room_name: call.room_name.clone(),
                        },
                    )
                    .await;
            }
            CallStatus::Declined => {
                dispatcher
                    .push(
                        &call.caller_id,
                        ServerEvent::CallDeclined {
                            call_id: call.call_id,
                        },
                    )
                    .await;
                self.note_call_message(call, CallMessageStatus::Declined, &call.caller_id, None)
                    .await;
            }
            CallStatus::Missed => {
                dispatcher
                    .push_many(
                        both,
                        &ServerEvent::CallTimeout {
                            call_id: call.call_id,
                        },
                    )
                    .await;
                self.note_call_message(call, CallMessageStatus::Missed, &call.caller_id, None)
                    .await;
            }
            CallStatus::Ended => {
                let duration = call.duration_secs.unwrap_or(0);
                if let Some(other) = call.counterpart(actor) {
                    dispatcher
                        .push(
                            other,
                            ServerEvent::CallEnded {
                                call_id: call.call_id,
                                ended_by: actor.clone(),
                                duration,
                            },
                        )
                        .await;
                }
                self.note_call_message(call, CallMessageStatus::Ended, actor, Some(duration))
                    .await;
            }
        }
    }

    async fn note_call_message(
        &self,
        call: &CallRecord,
        status: CallMessageStatus,
        sender: &UserId,
        duration: Option<i64>,
    ) {
        if let Err(e) = self.record_call_message(call, status, sender, duration).await {
            warn!(call = %call.call_id, status = %status, "Failed to record call message: {e}");
        }
    }

    /// Write the chat-visible record of a call transition. A duplicate is
    /// absorbed and nothing is pushed for it.
    async fn record_call_message(
        &self,
        call: &CallRecord,
        status: CallMessageStatus,
        sender: &UserId,
        duration: Option<i64>,
    ) -> Result<Option<DirectMessage>, ServerError> {
        let Some(receiver) = call.counterpart(sender) else {
            return Ok(None);
        };

        let mut message = DirectMessage::new(
            sender,
            receiver,
            call_message_text(call.call_kind, status, duration),
            MessageKind::Call,
            None,
            Utc::now(),
        );
        message.call_id = Some(call.call_id);
        message.call_status = Some(status);
        message.duration_secs = duration;

        let inserted = self
            .inner
            .store
            .run(|db| db.insert_message_if_absent(&message))?;
        if !inserted {
            debug!(call = %call.call_id, status = %status, "Duplicate call message absorbed");
            return Ok(None);
        }

        self.inner.conversations.upsert(
            sender,
            receiver,
            LastMessage {
                content: message.content.clone(),
                sender_id: sender.clone(),
                timestamp: message.timestamp,
                kind: MessageKind::Call,
                file_type: None,
            },
            UnreadEffect::NewMessage,
        )?;

        let mut payload = MessagePayload::from(&message);
        payload.status = MessageStatus::Delivered;
        self.inner
            .dispatcher
            .push_many([sender, receiver], &ServerEvent::NewMessage(payload))
            .await;
        Ok(Some(message))
    }

    fn arm_timer(&self, call_id: CallId, delay: Duration) {
        let engine = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match engine.expire(&call_id).await {
                Ok(true) => info!(call = %call_id, "Call missed after ring timeout"),
                Ok(false) => {}
                Err(e) => warn!(call = %call_id, "Ring timeout failed: {e}"),
            }
        });
        if let Ok(mut timers) = self.inner.timers.lock() {
            timers.insert(call_id, task.abort_handle());
        }
    }

    fn take_timer(&self, call_id: &CallId) -> Option<AbortHandle> {
        self.inner
            .timers
            .lock()
            .ok()
            .and_then(|mut timers| timers.remove(call_id))
    }

    #[cfg(test)]
    fn pending_timers(&self) -> usize {
        self.inner.timers.lock().map(|t| t.len()).unwrap_or(0)
    }
}

fn call_message_text(kind: CallKind, status: CallMessageStatus, duration: Option<i64>) -> String {
    let label = match kind {
        CallKind::Video => "Video call",
        CallKind::Audio => "Audio call",
    };
    match status {
        CallMessageStatus::Started => format!("{label} started"),
        CallMessageStatus::Ended => format!("{label} ended ({}s)", duration.unwrap_or(0)),
        CallMessageStatus::Missed => "Missed call".to_string(),
        CallMessageStatus::Declined => "Call declined".to_string(),
    }
}
