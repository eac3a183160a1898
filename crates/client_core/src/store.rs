//! In-memory message index keyed by thread.
//!
//! Sends are applied optimistically under a provisional id and replaced in
//! place once the server's copy arrives. Deletions are applied at once and
//! rolled back through a history refetch when the server rejects them.

use std::collections::{BTreeMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use shared::{
    domain::{Attachment, Message, MessageId, ThreadId, UserId},
    error::SessionError,
    protocol::ClientRequest,
};
use tracing::{debug, warn};

use crate::attachment::AttachmentLimits;

/// Max distance between a provisional message and the server copy matched
/// to it by content.
pub const RECONCILE_WINDOW_MS: i64 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted(ThreadId),
    Reconciled {
        thread_id: ThreadId,
        provisional: MessageId,
    },
    Duplicate(ThreadId),
}

impl AppendOutcome {
    pub fn changed_thread(&self) -> Option<&ThreadId> {
        match self {
            AppendOutcome::Inserted(thread_id)
            | AppendOutcome::Reconciled { thread_id, .. } => Some(thread_id),
            AppendOutcome::Duplicate(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub message: Message,
    pub request: ClientRequest,
}

#[derive(Debug, Clone)]
pub struct DeleteOutcome {
    pub thread_id: ThreadId,
    /// `None` when the message never reached the server.
    pub request: Option<ClientRequest>,
}

#[derive(Debug, Clone)]
struct PendingSend {
    provisional: MessageId,
    thread_id: ThreadId,
    body: String,
    timestamp: DateTime<Utc>,
    /// Never handed to the server; survives history snapshots.
    queued: bool,
}

#[derive(Debug, Clone)]
struct PendingDelete {
    message_id: MessageId,
    thread_id: ThreadId,
}

#[derive(Debug, Default)]
pub struct MessageStore {
    local_user: Option<UserId>,
    threads: BTreeMap<ThreadId, Vec<Message>>,
    pending_sends: Vec<PendingSend>,
    pending_deletes: VecDeque<PendingDelete>,
    limits: AttachmentLimits,
}

impl MessageStore {
    pub fn new(limits: AttachmentLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    pub fn local_user(&self) -> Option<&UserId> {
        self.local_user.as_ref()
    }

    pub fn set_local_user(&mut self, user: Option<UserId>) {
        self.local_user = user;
    }

    pub fn messages_for(&self, thread_id: &ThreadId) -> &[Message] {
        self.threads
            .get(thread_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.threads.keys().cloned().collect()
    }

    pub fn threads(&self) -> &BTreeMap<ThreadId, Vec<Message>> {
        &self.threads
    }

    pub fn is_pending(&self, message_id: &MessageId) -> bool {
        self.pending_sends
            .iter()
            .any(|pending| &pending.provisional == message_id)
    }

    /// Validates and optimistically applies a local send. Nothing is changed
    /// when validation fails.
    pub fn send_message(
        &mut self,
        body: &str,
        receiver: Option<UserId>,
        attachment: Option<Attachment>,
        now: DateTime<Utc>,
    ) -> Result<OutgoingMessage, SessionError> {
        let sender = self
            .local_user
            .clone()
            .ok_or_else(|| SessionError::validation("sign in before sending"))?;
        let body = body.trim();
        if body.is_empty() && attachment.is_none() {
            return Err(SessionError::validation("message is empty"));
        }
        if let Some(attachment) = &attachment {
            self.limits.validate(attachment)?;
        }
        let receiver = receiver.filter(|receiver| !receiver.as_str().trim().is_empty());

        let provisional = MessageId::provisional();
        let message = Message {
            id: provisional.clone(),
            sender,
            receiver: receiver.clone(),
            body: body.to_string(),
            attachment: attachment.clone(),
            timestamp: now,
            deleted_by: Default::default(),
            client_id: None,
        };
        let thread_id = message.thread_id();
        self.pending_sends.push(PendingSend {
            provisional: provisional.clone(),
            thread_id: thread_id.clone(),
            body: message.body.clone(),
            timestamp: now,
            queued: false,
        });
        self.threads
            .entry(thread_id.clone())
            .or_default()
            .push(message.clone());
        debug!(thread_id = %thread_id, message_id = %provisional, "optimistic send applied");

        Ok(OutgoingMessage {
            request: ClientRequest::SendMessage {
                client_id: provisional,
                body: message.body.clone(),
                receiver,
                attachment,
                timestamp: now,
            },
            message,
        })
    }

    /// Marks an optimistic send as held locally because the link could not
    /// carry it. Returns false for unknown ids.
    pub fn mark_queued(&mut self, provisional: &MessageId) -> bool {
        match self
            .pending_sends
            .iter_mut()
            .find(|pending| &pending.provisional == provisional)
        {
            Some(pending) => {
                pending.queued = true;
                true
            }
            None => false,
        }
    }

    pub fn is_queued(&self, message_id: &MessageId) -> bool {
        self.pending_sends
            .iter()
            .any(|pending| pending.queued && &pending.provisional == message_id)
    }

    /// Applies an inbound message. A server copy of one of our optimistic
    /// sends replaces the provisional entry in place.
    pub fn append(&mut self, message: Message) -> AppendOutcome {
        let thread_id = message.thread_id();
        if self
            .messages_for(&thread_id)
            .iter()
            .any(|existing| existing.id == message.id)
        {
            return AppendOutcome::Duplicate(thread_id);
        }

        if let Some(index) = self.reconcile_target(&message, &thread_id) {
            let pending = self.pending_sends.remove(index);
            let thread = self.threads.entry(thread_id.clone()).or_default();
            match thread
                .iter()
                .position(|existing| existing.id == pending.provisional)
            {
                Some(position) => thread[position] = message,
                None => thread.push(message),
            }
            return AppendOutcome::Reconciled {
                thread_id,
                provisional: pending.provisional,
            };
        }

        self.threads
            .entry(thread_id.clone())
            .or_default()
            .push(message);
        AppendOutcome::Inserted(thread_id)
    }

    fn reconcile_target(&self, message: &Message, thread_id: &ThreadId) -> Option<usize> {
        if self.local_user.as_ref() != Some(&message.sender) {
            return None;
        }
        if let Some(client_id) = &message.client_id {
            return self
                .pending_sends
                .iter()
                .position(|pending| &pending.provisional == client_id);
        }
        self.pending_sends
            .iter()
            .position(|pending| content_matches(pending, thread_id, message))
    }

    /// Replaces one thread with a server snapshot; the snapshot wins over
    /// local state except for queued sends the server has never seen, which
    /// stay at the end of the thread. Misrouted entries are appended to their
    /// own thread. Returns every thread that changed.
    pub fn replace_history(&mut self, thread_id: ThreadId, messages: Vec<Message>) -> Vec<ThreadId> {
        let mut seen = HashSet::new();
        let mut snapshot = Vec::with_capacity(messages.len());
        let mut misrouted = Vec::new();
        for message in messages {
            if !seen.insert(message.id.clone()) {
                continue;
            }
            if message.thread_id() == thread_id {
                snapshot.push(message);
            } else {
                misrouted.push(message);
            }
        }

        let previous = self.threads.remove(&thread_id).unwrap_or_default();
        let mut kept = Vec::new();
        let mut dropped = 0;
        let mut reconciled = 0;
        self.pending_sends.retain(|pending| {
            if pending.thread_id != thread_id {
                return true;
            }
            let confirmed = snapshot.iter().any(|message| {
                message.client_id.as_ref() == Some(&pending.provisional)
                    || content_matches(pending, &thread_id, message)
            });
            if confirmed {
                reconciled += 1;
                false
            } else if pending.queued {
                kept.push(pending.provisional.clone());
                true
            } else {
                dropped += 1;
                false
            }
        });
        if dropped > 0 || !kept.is_empty() {
            debug!(
                thread_id = %thread_id,
                dropped,
                reconciled,
                queued = kept.len(),
                "history snapshot superseded optimistic sends"
            );
        }
        snapshot.extend(
            previous
                .into_iter()
                .filter(|message| kept.contains(&message.id)),
        );

        self.threads.insert(thread_id.clone(), snapshot);
        let mut changed = vec![thread_id];
        for message in misrouted {
            warn!(message_id = %message.id, "history entry routed to another thread");
            if let Some(thread_id) = self.append(message).changed_thread() {
                if !changed.contains(thread_id) {
                    changed.push(thread_id.clone());
                }
            }
        }
        changed
    }

    /// Removes a message locally and returns the request that asks the
    /// server to do the same.
    pub fn delete_message(&mut self, message_id: &MessageId) -> Result<DeleteOutcome, SessionError> {
        let (thread_id, position) = self
            .locate(message_id)
            .ok_or_else(|| SessionError::validation(format!("unknown message {message_id}")))?;
        if let Some(thread) = self.threads.get_mut(&thread_id) {
            thread.remove(position);
        }

        if let Some(index) = self
            .pending_sends
            .iter()
            .position(|pending| &pending.provisional == message_id)
        {
            self.pending_sends.remove(index);
            debug!(message_id = %message_id, "deleted unsent message locally");
            return Ok(DeleteOutcome {
                thread_id,
                request: None,
            });
        }

        self.pending_deletes.push_back(PendingDelete {
            message_id: message_id.clone(),
            thread_id: thread_id.clone(),
        });
        Ok(DeleteOutcome {
            thread_id,
            request: Some(ClientRequest::DeleteMessage {
                message_id: message_id.clone(),
            }),
        })
    }

    /// Applies a server-confirmed deletion. A message deleted by its author
    /// or by the local user disappears; deletions by anyone else only mark
    /// it hidden for them.
    pub fn on_message_deleted(
        &mut self,
        message_id: &MessageId,
        deleted_by: &UserId,
    ) -> Option<ThreadId> {
        self.pending_deletes
            .retain(|pending| &pending.message_id != message_id);
        let (thread_id, position) = self.locate(message_id)?;
        let thread = self.threads.get_mut(&thread_id)?;
        let removes = &thread[position].sender == deleted_by
            || self.local_user.as_ref() == Some(deleted_by);
        if removes {
            thread.remove(position);
        } else if !thread[position].deleted_by.insert(deleted_by.clone()) {
            return None;
        }
        Some(thread_id)
    }

    /// Forgets the rejected deletion and returns the thread that has to be
    /// refetched to restore it. Without an id the oldest outstanding
    /// deletion is assumed.
    pub fn on_delete_rejected(&mut self, message_id: Option<&MessageId>) -> Option<ThreadId> {
        let index = match message_id {
            Some(message_id) => self
                .pending_deletes
                .iter()
                .position(|pending| &pending.message_id == message_id)?,
            None => 0,
        };
        self.pending_deletes
            .remove(index)
            .map(|pending| pending.thread_id)
    }

    pub fn pending_deletions(&self) -> usize {
        self.pending_deletes.len()
    }

    /// Replaces the whole index, typically with the offline snapshot.
    /// Unacknowledged local sends in it become pending again and are treated
    /// as queued, since nothing retransmits them.
    pub fn load_snapshot(&mut self, threads: BTreeMap<ThreadId, Vec<Message>>) {
        self.pending_sends = threads
            .iter()
            .flat_map(|(thread_id, messages)| {
                messages
                    .iter()
                    .filter(|message| message.id.is_provisional())
                    .map(move |message| PendingSend {
                        provisional: message.id.clone(),
                        thread_id: thread_id.clone(),
                        body: message.body.clone(),
                        timestamp: message.timestamp,
                        queued: true,
                    })
            })
            .collect();
        self.pending_deletes.clear();
        self.threads = threads;
    }

    pub fn clear(&mut self) {
        self.local_user = None;
        self.threads.clear();
        self.pending_sends.clear();
        self.pending_deletes.clear();
    }

    fn locate(&self, message_id: &MessageId) -> Option<(ThreadId, usize)> {
        self.threads.iter().find_map(|(thread_id, messages)| {
            messages
                .iter()
                .position(|message| &message.id == message_id)
                .map(|position| (thread_id.clone(), position))
        })
    }
}

fn content_matches(pending: &PendingSend, thread_id: &ThreadId, message: &Message) -> bool {
    &pending.thread_id == thread_id
        && pending.body == message.body
        && (message.timestamp - pending.timestamp)
            .num_milliseconds()
            .abs()
            <= RECONCILE_WINDOW_MS
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
