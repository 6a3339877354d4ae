// Live credentials shared by the REST client and both transports.
//
// Holders keep a `watch::Receiver` and read the current value at the
// start of every request or connection attempt, so a password change
// takes effect on the next reconnect without restarting anything.

use secrecy::{ExposeSecret, SecretString};
use tokio::sync::watch;

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    pub fn is_present(&self) -> bool {
        !self.username.is_empty()
    }

    pub(crate) fn password(&self) -> &str {
        self.password.expose_secret()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Owner side of the credentials channel.
#[derive(Debug, Clone)]
pub struct CredentialsHandle {
    tx: watch::Sender<Credentials>,
}

impl CredentialsHandle {
    pub fn new(initial: Credentials) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn watch(&self) -> watch::Receiver<Credentials> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Credentials {
        self.tx.borrow().clone()
    }

    /// Publish new credentials. Takes effect on the next request or
    /// connection attempt of every holder.
    pub fn update(&self, credentials: Credentials) {
        tracing::info!(username = %credentials.username, "credentials updated");
        self.tx.send_replace(credentials);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_reaches_receivers() {
        let handle = CredentialsHandle::new(Credentials::new("guest", "old"));
        let rx = handle.watch();

        handle.update(Credentials::new("admin", "new"));

        let current = rx.borrow().clone();
        assert_eq!(current.username, "admin");
        assert_eq!(current.password(), "new");
    }

    #[test]
    fn debug_redacts_password() {
        let creds = Credentials::new("guest", "hunter2");
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("guest"));
        assert!(!rendered.contains("hunter2"));
    }
}
