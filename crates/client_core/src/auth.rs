use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::{Credentials, UserId, PRIVATE_THREAD_SEPARATOR},
    error::SessionError,
    protocol::ClientRequest,
};
use tracing::{debug, info, warn};
use zeroize::Zeroize;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load_last_credentials(&self) -> Result<Option<Credentials>>;
    async fn save_credentials(&self, credentials: &Credentials) -> Result<()>;
    async fn clear_credentials(&self, username: &str) -> Result<()>;
}

/// Credential store that never remembers anything.
pub struct MissingCredentialStore;

#[async_trait]
impl CredentialStore for MissingCredentialStore {
    async fn load_last_credentials(&self) -> Result<Option<Credentials>> {
        Ok(None)
    }

    async fn save_credentials(&self, _credentials: &Credentials) -> Result<()> {
        Ok(())
    }

    async fn clear_credentials(&self, _username: &str) -> Result<()> {
        Ok(())
    }
}

/// Holds the credentials of the current identity. Secrets never leave the
/// vault except inside an `auth` request or the durable store.
pub struct CredentialVault {
    store: Arc<dyn CredentialStore>,
    remember: bool,
    current: Option<Credentials>,
}

impl CredentialVault {
    pub fn new(store: Arc<dyn CredentialStore>, remember: bool) -> Self {
        Self {
            store,
            remember,
            current: None,
        }
    }

    pub async fn restore(&mut self) -> Result<Option<&str>> {
        if !self.remember {
            return Ok(None);
        }
        self.current = self.store.load_last_credentials().await?;
        Ok(self.username())
    }

    pub fn stage(&mut self, credentials: Credentials) {
        self.wipe();
        self.current = Some(credentials);
    }

    pub fn username(&self) -> Option<&str> {
        self.current.as_ref().map(|credentials| credentials.username.as_str())
    }

    fn auth_request(&self) -> Option<ClientRequest> {
        self.current.as_ref().map(|credentials| ClientRequest::Auth {
            username: credentials.username.clone(),
            secret: credentials.secret.clone(),
        })
    }

    fn secret_matches(&self, secret: &str) -> bool {
        self.current
            .as_ref()
            .is_some_and(|credentials| credentials.secret == secret)
    }

    pub async fn commit(&self) -> Result<()> {
        match (&self.current, self.remember) {
            (Some(credentials), true) => self.store.save_credentials(credentials).await,
            _ => Ok(()),
        }
    }

    pub async fn replace_secret(&mut self, new_secret: String) -> Result<()> {
        if let Some(credentials) = self.current.as_mut() {
            credentials.secret.zeroize();
            credentials.secret = new_secret;
        }
        self.commit().await
    }

    /// Forgets the current identity both in memory and in the durable store.
    pub async fn clear(&mut self) -> Result<()> {
        let username = self.username().map(str::to_string);
        self.wipe();
        if let Some(username) = username {
            self.store.clear_credentials(&username).await?;
        }
        Ok(())
    }

    fn wipe(&mut self) {
        if let Some(mut credentials) = self.current.take() {
            credentials.secret.zeroize();
        }
    }
}

impl Drop for CredentialVault {
    fn drop(&mut self) {
        self.wipe();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Pending,
    Authenticated,
}

pub struct AuthSession {
    state: AuthState,
    vault: CredentialVault,
    user_id: Option<UserId>,
    pending_secret: Option<String>,
}

impl AuthSession {
    pub fn new(vault: CredentialVault) -> Self {
        Self {
            state: AuthState::Unauthenticated,
            vault,
            user_id: None,
            pending_secret: None,
        }
    }

    /// Loads remembered credentials so the next connect can re-authenticate.
    pub async fn restore(&mut self) -> Result<Option<String>> {
        let restored = self.vault.restore().await?.map(str::to_string);
        if let Some(username) = &restored {
            info!(username = %username, "restored remembered credentials");
        }
        Ok(restored)
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    pub fn username(&self) -> Option<&str> {
        self.vault.username()
    }

    pub fn has_credentials(&self) -> bool {
        self.vault.username().is_some()
    }

    pub fn authenticate(&mut self, credentials: Credentials) -> Result<ClientRequest, SessionError> {
        if credentials.username.trim().is_empty() {
            return Err(SessionError::validation("username is empty"));
        }
        if credentials.username.contains(PRIVATE_THREAD_SEPARATOR) {
            return Err(SessionError::validation(format!(
                "username may not contain '{PRIVATE_THREAD_SEPARATOR}'"
            )));
        }
        if credentials.secret.is_empty() {
            return Err(SessionError::validation("password is empty"));
        }
        self.vault.stage(credentials);
        self.user_id = None;
        self.state = AuthState::Pending;
        self.vault
            .auth_request()
            .ok_or_else(|| SessionError::validation("no credentials staged"))
    }

    /// Called on every transition to connected. Returns the one `auth`
    /// request to send, if credentials are known.
    pub fn on_connected(&mut self) -> Option<ClientRequest> {
        let request = self.vault.auth_request()?;
        self.state = AuthState::Pending;
        debug!("re-authenticating after connect");
        Some(request)
    }

    pub fn on_disconnected(&mut self) {
        if self.state != AuthState::Unauthenticated {
            self.state = AuthState::Unauthenticated;
        }
    }

    /// Marks the session authenticated and remembers the credentials. The
    /// state change stands even when persisting fails.
    pub async fn on_auth_success(&mut self, user_id: UserId) -> Result<()> {
        if self.state != AuthState::Pending {
            warn!(user_id = %user_id, "auth success without a pending request");
        }
        info!(user_id = %user_id, "authenticated");
        self.state = AuthState::Authenticated;
        self.user_id = Some(user_id);
        self.vault.commit().await
    }

    pub async fn on_auth_failed(&mut self) -> SessionError {
        warn!(username = ?self.vault.username(), "authentication rejected");
        self.state = AuthState::Unauthenticated;
        self.user_id = None;
        self.pending_secret = None;
        if let Err(err) = self.vault.clear().await {
            warn!(error = %err, "failed to clear rejected credentials");
        }
        SessionError::AuthenticationRejected
    }

    pub fn begin_password_change(
        &mut self,
        old_secret: &str,
        new_secret: &str,
    ) -> Result<ClientRequest, SessionError> {
        if self.state != AuthState::Authenticated {
            return Err(SessionError::validation("sign in before changing password"));
        }
        if new_secret.is_empty() || new_secret == old_secret {
            return Err(SessionError::validation("new password must differ from the old one"));
        }
        if !self.vault.secret_matches(old_secret) {
            return Err(SessionError::validation("current password does not match"));
        }
        let username = self
            .vault
            .username()
            .ok_or_else(|| SessionError::validation("no signed-in user"))?
            .to_string();
        self.pending_secret = Some(new_secret.to_string());
        Ok(ClientRequest::ChangePassword {
            username,
            old_secret: old_secret.to_string(),
            new_secret: new_secret.to_string(),
        })
    }

    pub async fn on_password_change_result(&mut self, success: bool) -> Result<()> {
        let Some(new_secret) = self.pending_secret.take() else {
            warn!("password change result without a pending change");
            return Ok(());
        };
        if success {
            info!("password changed");
            self.vault.replace_secret(new_secret).await
        } else {
            let mut new_secret = new_secret;
            new_secret.zeroize();
            warn!("password change rejected by server");
            Ok(())
        }
    }

    pub async fn logout(&mut self) -> Result<()> {
        self.state = AuthState::Unauthenticated;
        self.user_id = None;
        if let Some(secret) = self.pending_secret.as_mut() {
            secret.zeroize();
        }
        self.pending_secret = None;
        self.vault.clear().await
    }
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
