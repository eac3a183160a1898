use std::{collections::BTreeSet, sync::Arc};

use chrono::Utc;
use shared::{
    domain::{Attachment, Credentials, Message, MessageId, ThreadId, UserId},
    error::SessionError,
    protocol::{ClientRequest, ServerEvent},
};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::{
    attachment::AttachmentLimits,
    auth::{AuthSession, CredentialVault},
    offline_cache::{CachedSnapshot, OfflineCache},
    presence::PresenceTracker,
    store::{AppendOutcome, MessageStore},
    transport::{ConnectionState, ServerLink, Subscription, TransportEvent, CONNECTION_EVENT_NAMES},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub status: SessionStatus,
    pub current_user: Option<UserId>,
}

/// Changes pushed to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    StatusChanged(Session),
    AuthenticationFailed,
    LoggedOut,
    PresenceChanged(Vec<UserId>),
    ThreadUpdated(ThreadId),
    OfflineModeChanged(bool),
    PeerAdded(UserId),
    ProfilePictureUpdated(String),
    PasswordChanged { success: bool },
    DeletionRolledBack { thread_id: ThreadId, error: SessionError },
    Error(SessionError),
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub remember_credentials: bool,
    pub attachment_limits: AttachmentLimits,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            remember_credentials: true,
            attachment_limits: AttachmentLimits::default(),
        }
    }
}

struct ControllerState {
    status: SessionStatus,
    auth: AuthSession,
    presence: PresenceTracker,
    store: MessageStore,
    offline: bool,
    selected_thread: ThreadId,
    requested_threads: BTreeSet<ThreadId>,
    profile_picture: Option<String>,
    /// Identity whose threads the in-memory index holds. Cache writes are
    /// keyed by it, never by credentials still awaiting a verdict.
    index_owner: Option<String>,
}

impl ControllerState {
    /// Key of the local identity in the offline cache.
    fn owner(&self) -> Option<String> {
        self.auth
            .username()
            .map(str::to_string)
            .or_else(|| self.auth.user_id().map(UserId::to_string))
    }

    fn session(&self) -> Session {
        Session {
            status: self.status,
            current_user: self.auth.user_id().cloned(),
        }
    }

    fn can_transmit(&self) -> bool {
        !self.offline && self.status == SessionStatus::Authenticated
    }
}

/// Owns the session state machine. Transport events are queued by
/// subscriptions registered once in [`SessionController::new`] and applied
/// one at a time by [`SessionController::run`].
pub struct SessionController {
    link: Arc<dyn ServerLink>,
    cache: OfflineCache,
    limits: AttachmentLimits,
    inner: Mutex<ControllerState>,
    inbox: Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
    updates: broadcast::Sender<SessionUpdate>,
    _subscriptions: Vec<Subscription>,
}

impl SessionController {
    pub fn new(link: Arc<dyn ServerLink>, cache: OfflineCache, options: SessionOptions) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let subscriptions = CONNECTION_EVENT_NAMES
            .iter()
            .chain(ServerEvent::NAMES.iter())
            .map(|name| {
                let inbox_tx = inbox_tx.clone();
                link.subscribe(
                    name,
                    Arc::new(move |event: &TransportEvent| {
                        let _ = inbox_tx.send(event.clone());
                    }),
                )
            })
            .collect();
        let (updates, _) = broadcast::channel(256);
        let vault = CredentialVault::new(Arc::new(cache.clone()), options.remember_credentials);

        Arc::new(Self {
            link,
            cache,
            limits: options.attachment_limits.clone(),
            inner: Mutex::new(ControllerState {
                status: SessionStatus::Disconnected,
                auth: AuthSession::new(vault),
                presence: PresenceTracker::default(),
                store: MessageStore::new(options.attachment_limits),
                offline: false,
                selected_thread: ThreadId::broadcast(),
                requested_threads: BTreeSet::new(),
                profile_picture: None,
                index_owner: None,
            }),
            inbox: Mutex::new(inbox_rx),
            updates,
            _subscriptions: subscriptions,
        })
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    /// Restores remembered credentials, warms the index from their cache and
    /// opens the connection.
    pub async fn start(&self) {
        let mut state = self.inner.lock().await;
        let before = state.session();
        let restored = state.auth.restore().await;
        match restored {
            Ok(Some(username)) => {
                if self.bind_index(&mut state, &username) {
                    if let Err(err) = self.load_cached(&mut state, &username).await {
                        warn!(owner = %username, error = %err, "failed to warm message index from cache");
                    }
                }
            }
            Ok(None) => debug!("no remembered credentials"),
            Err(err) => warn!(error = %err, "failed to restore remembered credentials"),
        }
        self.connect_link(&mut state);
        self.emit_status_change(&state, &before);
    }

    /// Applies queued transport events until the link is dropped.
    pub async fn run(self: Arc<Self>) {
        let mut inbox = self.inbox.lock().await;
        while let Some(event) = inbox.recv().await {
            self.handle_event(event).await;
        }
        debug!("session event queue closed");
    }

    /// Applies every event queued so far and returns how many were handled.
    pub async fn process_pending(&self) -> usize {
        let mut handled = 0;
        loop {
            let next = self.inbox.lock().await.try_recv();
            let Ok(event) = next else {
                return handled;
            };
            self.handle_event(event).await;
            handled += 1;
        }
    }

    pub async fn handle_event(&self, event: TransportEvent) {
        let mut state = self.inner.lock().await;
        let before = state.session();
        match event {
            TransportEvent::Reconnecting { attempt } => {
                debug!(attempt, "reconnecting");
                if state.status == SessionStatus::Disconnected {
                    state.status = SessionStatus::Connecting;
                }
            }
            TransportEvent::Connected => self.on_connected(&mut state),
            TransportEvent::Disconnected { reason } => {
                info!(%reason, "session disconnected");
                state.status = SessionStatus::Disconnected;
                state.auth.on_disconnected();
                if state.presence.clear() {
                    self.emit(SessionUpdate::PresenceChanged(Vec::new()));
                }
            }
            TransportEvent::Unreachable { attempt, error } => {
                debug!(attempt, %error, "server unreachable");
                state.status = SessionStatus::Disconnected;
                state.auth.on_disconnected();
                self.enter_offline_mode(&mut state).await;
            }
            TransportEvent::Server(event) => self.on_server_event(&mut state, event).await,
        }
        self.emit_status_change(&state, &before);
    }

    pub async fn login(&self, username: &str, secret: &str) -> Result<(), SessionError> {
        let mut state = self.inner.lock().await;
        let before = state.session();
        let request = state
            .auth
            .authenticate(Credentials::new(username.trim(), secret))?;
        info!(username = %username.trim(), "login requested");
        if self.link.state() == ConnectionState::Connected {
            self.link.send(&request)?;
        } else {
            self.connect_link(&mut state);
        }
        self.emit_status_change(&state, &before);
        Ok(())
    }

    /// Sends a message to `receiver`, or to everyone when `None`. The message
    /// is visible and cached before the server sees it.
    pub async fn send_message(
        &self,
        body: &str,
        receiver: Option<UserId>,
        attachment: Option<Attachment>,
    ) -> Result<MessageId, SessionError> {
        let mut state = self.inner.lock().await;
        let outgoing = state
            .store
            .send_message(body, receiver, attachment, Utc::now())?;
        let thread_id = outgoing.message.thread_id();
        self.persist_thread(&state, &thread_id).await;
        self.record_peer(&state, &outgoing.message).await;
        self.emit(SessionUpdate::ThreadUpdated(thread_id));

        let delivered = state.can_transmit()
            && match self.transmit(&outgoing.request) {
                Ok(()) => true,
                Err(err) => {
                    self.emit(SessionUpdate::Error(err));
                    false
                }
            };
        if !delivered {
            state.store.mark_queued(&outgoing.message.id);
            debug!(message_id = %outgoing.message.id, "message queued in local cache");
        }
        Ok(outgoing.message.id)
    }

    /// Removes a message at once; the server's verdict arrives later as
    /// `message-deleted` or `delete-rejected`.
    pub async fn delete_message(&self, message_id: &MessageId) -> Result<(), SessionError> {
        let mut state = self.inner.lock().await;
        if !state.can_transmit() {
            return Err(SessionError::transport("cannot delete while offline"));
        }
        let outcome = state.store.delete_message(message_id)?;
        state.requested_threads.insert(outcome.thread_id.clone());
        self.persist_thread(&state, &outcome.thread_id).await;
        self.emit(SessionUpdate::ThreadUpdated(outcome.thread_id));
        if let Some(request) = outcome.request {
            // An unsent deletion is repaired by the history refetch after reconnect.
            if let Err(err) = self.transmit(&request) {
                self.emit(SessionUpdate::Error(err));
            }
        }
        Ok(())
    }

    /// Makes `thread_id` current and returns its messages. The first
    /// selection of a thread asks the server for its history.
    pub async fn select_thread(&self, thread_id: ThreadId) -> Vec<Message> {
        let mut state = self.inner.lock().await;
        state.selected_thread = thread_id.clone();
        if state.requested_threads.insert(thread_id.clone()) && state.can_transmit() {
            let _ = self.transmit(&ClientRequest::RequestHistory {
                thread_id: thread_id.clone(),
            });
        }
        state.store.messages_for(&thread_id).to_vec()
    }

    pub async fn select_private_thread(&self, peer: &UserId) -> Result<Vec<Message>, SessionError> {
        let local = {
            let state = self.inner.lock().await;
            state
                .store
                .local_user()
                .cloned()
                .ok_or_else(|| SessionError::validation("sign in before opening a private chat"))?
        };
        Ok(self.select_thread(ThreadId::private(&local, peer)).await)
    }

    pub async fn mark_thread_read(&self, thread_id: &ThreadId) -> Result<(), SessionError> {
        let state = self.inner.lock().await;
        let reader = state
            .auth
            .user_id()
            .cloned()
            .filter(|_| state.can_transmit())
            .ok_or_else(|| SessionError::transport("not connected"))?;
        self.transmit(&ClientRequest::MarkThreadRead {
            thread_id: thread_id.clone(),
            reader,
        })
    }

    pub async fn update_profile_picture(&self, image: &Attachment) -> Result<(), SessionError> {
        let state = self.inner.lock().await;
        if !image.mime_type.trim().to_ascii_lowercase().starts_with("image/") {
            return Err(SessionError::validation("profile picture must be an image"));
        }
        self.limits.validate(image)?;
        let username = state
            .owner()
            .filter(|_| state.can_transmit())
            .ok_or_else(|| SessionError::transport("not connected"))?;
        self.transmit(&ClientRequest::UpdateProfilePicture {
            username,
            image_data: image.encoded_data.clone(),
        })
    }

    pub async fn change_password(&self, old_secret: &str, new_secret: &str) -> Result<(), SessionError> {
        let mut state = self.inner.lock().await;
        if !state.can_transmit() {
            return Err(SessionError::transport("not connected"));
        }
        let request = state.auth.begin_password_change(old_secret, new_secret)?;
        self.transmit(&request)
    }

    /// Forgets the identity, clears in-memory state and closes the link.
    pub async fn logout(&self) {
        let mut state = self.inner.lock().await;
        if let Err(err) = state.auth.logout().await {
            warn!(error = %err, "failed to clear remembered credentials");
        }
        self.link.disconnect();
        state.status = SessionStatus::Disconnected;
        self.reset_index(&mut state);
        state.offline = false;
        info!("logged out");
        self.emit(SessionUpdate::LoggedOut);
        self.emit(SessionUpdate::StatusChanged(state.session()));
    }

    pub async fn session(&self) -> Session {
        self.inner.lock().await.session()
    }

    pub async fn messages_for(&self, thread_id: &ThreadId) -> Vec<Message> {
        self.inner.lock().await.store.messages_for(thread_id).to_vec()
    }

    pub async fn thread_ids(&self) -> Vec<ThreadId> {
        self.inner.lock().await.store.thread_ids()
    }

    pub async fn selected_thread(&self) -> ThreadId {
        self.inner.lock().await.selected_thread.clone()
    }

    pub async fn online_users(&self) -> Vec<UserId> {
        self.inner.lock().await.presence.online_users()
    }

    pub async fn is_online(&self, user: &UserId) -> bool {
        self.inner.lock().await.presence.is_online(user)
    }

    pub async fn is_offline(&self) -> bool {
        self.inner.lock().await.offline
    }

    pub async fn profile_picture(&self) -> Option<String> {
        self.inner.lock().await.profile_picture.clone()
    }

    pub async fn known_peers(&self) -> Vec<UserId> {
        let Some(owner) = self.inner.lock().await.index_owner.clone() else {
            return Vec::new();
        };
        self.cache.known_peers(&owner).await.unwrap_or_else(|err| {
            warn!(error = %err, "failed to read known peers");
            Vec::new()
        })
    }

    fn connect_link(&self, state: &mut ControllerState) {
        if state.status == SessionStatus::Disconnected {
            state.status = SessionStatus::Connecting;
        }
        self.link.connect();
    }

    fn on_connected(&self, state: &mut ControllerState) {
        state.status = SessionStatus::Connected;
        if state.offline {
            state.offline = false;
            info!("leaving offline mode");
            self.emit(SessionUpdate::OfflineModeChanged(false));
        }
        if let Some(request) = state.auth.on_connected() {
            let _ = self.transmit(&request);
        }
    }

    async fn on_server_event(&self, state: &mut ControllerState, event: ServerEvent) {
        match event {
            ServerEvent::AuthSuccess { user_id } => self.on_auth_success(state, user_id).await,
            ServerEvent::AuthFailed {} => {
                let err = state.auth.on_auth_failed().await;
                state.status = match self.link.state() {
                    ConnectionState::Connected => SessionStatus::Connected,
                    _ => SessionStatus::Disconnected,
                };
                self.reset_index(state);
                self.emit(SessionUpdate::AuthenticationFailed);
                self.emit(SessionUpdate::Error(err));
            }
            ServerEvent::PresenceSnapshot { users } => {
                if state.presence.on_presence_snapshot(users) {
                    self.emit(SessionUpdate::PresenceChanged(state.presence.online_users()));
                }
            }
            ServerEvent::Message(message) => {
                let outcome = state.store.append(message.clone());
                let (AppendOutcome::Inserted(thread_id) | AppendOutcome::Reconciled { thread_id, .. }) =
                    outcome
                else {
                    debug!(message_id = %message.id, "duplicate message ignored");
                    return;
                };
                self.persist_thread(state, &thread_id).await;
                self.record_peer(state, &message).await;
                self.emit(SessionUpdate::ThreadUpdated(thread_id));
            }
            ServerEvent::HistorySnapshot {
                thread_id,
                messages,
            } => {
                debug!(thread_id = %thread_id, count = messages.len(), "history snapshot received");
                for thread_id in state.store.replace_history(thread_id, messages) {
                    self.persist_thread(state, &thread_id).await;
                    self.emit(SessionUpdate::ThreadUpdated(thread_id));
                }
            }
            ServerEvent::MessageDeleted {
                message_id,
                deleted_by,
            } => {
                if let Some(thread_id) = state.store.on_message_deleted(&message_id, &deleted_by) {
                    self.persist_thread(state, &thread_id).await;
                    self.emit(SessionUpdate::ThreadUpdated(thread_id));
                }
            }
            ServerEvent::DeleteRejected { error, message_id } => {
                warn!(error = %error, message_id = ?message_id, "deletion rejected by server");
                let Some(thread_id) = state.store.on_delete_rejected(message_id.as_ref()) else {
                    warn!("no outstanding deletion to roll back");
                    return;
                };
                let refetch = ClientRequest::RequestHistory {
                    thread_id: thread_id.clone(),
                };
                match self.transmit(&refetch) {
                    Ok(()) => self.emit(SessionUpdate::DeletionRolledBack {
                        thread_id,
                        error: SessionError::DeletionRejected(error),
                    }),
                    Err(_) => self.emit(SessionUpdate::Error(SessionError::transport(format!(
                        "could not resynchronize {thread_id} after rejected deletion"
                    )))),
                }
            }
            ServerEvent::ProfilePictureUpdated {
                success,
                image_data,
                error,
            } => match (success, image_data) {
                (true, Some(image_data)) => {
                    if let Some(owner) = &state.index_owner {
                        if let Err(err) = self.cache.save_profile_picture(owner, &image_data).await {
                            warn!(error = %err, "failed to cache profile picture");
                        }
                    }
                    state.profile_picture = Some(image_data.clone());
                    self.emit(SessionUpdate::ProfilePictureUpdated(image_data));
                }
                _ => {
                    let reason = error.unwrap_or_else(|| "profile picture rejected".to_string());
                    warn!(error = %reason, "profile picture update failed");
                    self.emit(SessionUpdate::Error(SessionError::validation(reason)));
                }
            },
            ServerEvent::PasswordChangeResult { success } => {
                if let Err(err) = state.auth.on_password_change_result(success).await {
                    warn!(error = %err, "failed to remember new password");
                }
                self.emit(SessionUpdate::PasswordChanged { success });
            }
            ServerEvent::UseLocalStorage {} => {
                info!("server asked for local storage");
                self.enter_offline_mode(state).await;
            }
        }
    }

    async fn on_auth_success(&self, state: &mut ControllerState, user_id: UserId) {
        if let Err(err) = state.auth.on_auth_success(user_id.clone()).await {
            warn!(error = %err, "failed to remember credentials");
        }
        state.status = SessionStatus::Authenticated;

        if let Some(owner) = state.owner() {
            if self.bind_index(state, &owner) {
                if let Err(err) = self.load_cached(state, &owner).await {
                    warn!(owner, error = %err, "failed to warm message index from cache");
                }
            }
            let snapshot = CachedSnapshot {
                credentials: None,
                threads: state.store.threads().clone(),
            };
            if let Err(err) = self.cache.persist(&owner, &snapshot).await {
                warn!(owner, error = %err, "failed to persist snapshot after authentication");
            }
        }
        state.store.set_local_user(Some(user_id.clone()));
        state.presence.set_local_user(Some(user_id));
        for thread_id in state.store.thread_ids() {
            self.emit(SessionUpdate::ThreadUpdated(thread_id));
        }

        let selected = state.selected_thread.clone();
        state.requested_threads.insert(ThreadId::broadcast());
        state.requested_threads.insert(selected);
        for thread_id in &state.requested_threads {
            let _ = self.transmit(&ClientRequest::RequestHistory {
                thread_id: thread_id.clone(),
            });
        }
    }

    async fn enter_offline_mode(&self, state: &mut ControllerState) {
        if state.offline {
            return;
        }
        state.offline = true;
        info!("entering offline mode");
        self.emit(SessionUpdate::OfflineModeChanged(true));

        let Some(owner) = state.owner() else {
            debug!("no local identity; offline cache not loaded");
            return;
        };
        self.bind_index(state, &owner);
        match self.load_cached(state, &owner).await {
            Ok(threads) => info!(owner, threads, "serving messages from offline cache"),
            Err(err) => {
                warn!(owner, error = %err, "failed to load offline cache");
                self.emit(SessionUpdate::Error(SessionError::transport(format!(
                    "offline cache unavailable: {err}"
                ))));
            }
        }
    }

    /// Points the index at `owner`. Another identity's threads, presence,
    /// history requests and picture are dropped first. Returns false when
    /// the index already belonged to `owner`.
    fn bind_index(&self, state: &mut ControllerState, owner: &str) -> bool {
        if state.index_owner.as_deref() == Some(owner) {
            return false;
        }
        if let Some(previous) = &state.index_owner {
            info!(previous = %previous, owner, "switching local identity");
        }
        self.reset_index(state);
        state.index_owner = Some(owner.to_string());
        state.store.set_local_user(Some(UserId::from(owner)));
        true
    }

    /// Drops everything held for the current identity.
    fn reset_index(&self, state: &mut ControllerState) {
        let dropped = state.store.thread_ids();
        state.store.clear();
        if state.presence.clear() {
            self.emit(SessionUpdate::PresenceChanged(Vec::new()));
        }
        state.presence.set_local_user(None);
        state.requested_threads.clear();
        state.selected_thread = ThreadId::broadcast();
        state.profile_picture = None;
        state.index_owner = None;
        for thread_id in dropped {
            self.emit(SessionUpdate::ThreadUpdated(thread_id));
        }
    }

    /// Replaces the index with `owner`'s cached snapshot and returns the
    /// number of threads loaded.
    async fn load_cached(&self, state: &mut ControllerState, owner: &str) -> anyhow::Result<usize> {
        let snapshot = self.cache.load(owner).await?;
        let thread_ids: Vec<ThreadId> = snapshot.threads.keys().cloned().collect();
        state.store.load_snapshot(snapshot.threads);
        if state.profile_picture.is_none() {
            state.profile_picture = self.cache.load_profile_picture(owner).await?;
        }
        for thread_id in &thread_ids {
            self.emit(SessionUpdate::ThreadUpdated(thread_id.clone()));
        }
        Ok(thread_ids.len())
    }

    fn transmit(&self, request: &ClientRequest) -> Result<(), SessionError> {
        self.link.send(request).inspect_err(|err| {
            warn!(event = request.name(), error = %err, "request not sent");
        })
    }

    async fn persist_thread(&self, state: &ControllerState, thread_id: &ThreadId) {
        let Some(owner) = &state.index_owner else {
            return;
        };
        if let Err(err) = self
            .cache
            .persist_thread(owner, thread_id, state.store.messages_for(thread_id))
            .await
        {
            warn!(owner, thread_id = %thread_id, error = %err, "failed to persist thread");
        }
    }

    async fn record_peer(&self, state: &ControllerState, message: &Message) {
        let (Some(owner), Some(local)) = (&state.index_owner, state.store.local_user()) else {
            return;
        };
        let Some(peer) = message.peer_of(local) else {
            return;
        };
        match self.cache.remember_peer(owner, peer).await {
            Ok(true) => self.emit(SessionUpdate::PeerAdded(peer.clone())),
            Ok(false) => {}
            Err(err) => warn!(owner, peer = %peer, error = %err, "failed to record peer"),
        }
    }

    fn emit_status_change(&self, state: &ControllerState, before: &Session) {
        let after = state.session();
        if &after != before {
            info!(status = ?after.status, user = ?after.current_user, "session status changed");
            self.emit(SessionUpdate::StatusChanged(after));
        }
    }

    fn emit(&self, update: SessionUpdate) {
        let _ = self.updates.send(update);
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
