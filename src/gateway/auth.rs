//! SSH authentication strategies.
//!
//! The gateway authenticates with "none" first (some appliances accept it
//! and it surfaces the server's accepted methods), then falls back to
//! password authentication. Strategies implement a common trait so the
//! chain can try them in order.

use async_trait::async_trait;
use russh::client;
use tracing::debug;

use super::error::GatewayError;
use super::session::GatewayClientHandler;

/// Trait for SSH authentication strategies.
///
/// `Ok(true)` means the server accepted the authentication, `Ok(false)`
/// means it was rejected, and `Err` is a transport-level failure.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<GatewayClientHandler>,
        username: &str,
    ) -> Result<bool, GatewayError>;

    fn name(&self) -> &'static str;
}

/// "none" authentication, tried before credentials.
pub struct NoneAuth;

#[async_trait]
impl AuthStrategy for NoneAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<GatewayClientHandler>,
        username: &str,
    ) -> Result<bool, GatewayError> {
        let result = handle
            .authenticate_none(username)
            .await
            .map_err(|e| GatewayError::SshAuthFailed(format!("none auth error: {}", e)))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Password authentication.
pub struct PasswordAuth {
    password: String,
}

impl PasswordAuth {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<GatewayClientHandler>,
        username: &str,
    ) -> Result<bool, GatewayError> {
        let result = handle
            .authenticate_password(username, &self.password)
            .await
            .map_err(|e| GatewayError::SshAuthFailed(format!("password auth error: {}", e)))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "password"
    }
}

/// Ordered chain of authentication strategies.
///
/// The first strategy accepted by the server wins. If every strategy is
/// rejected the chain fails with `ssh-auth-failed`.
pub struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    /// Build the gateway's standard chain: "none" first, then password.
    pub fn for_password(password: impl Into<String>) -> Self {
        Self {
            strategies: vec![Box::new(NoneAuth), Box::new(PasswordAuth::new(password))],
        }
    }

    pub async fn authenticate(
        &self,
        handle: &mut client::Handle<GatewayClientHandler>,
        username: &str,
    ) -> Result<(), GatewayError> {
        let mut last_error: Option<GatewayError> = None;

        for strategy in &self.strategies {
            debug!("Trying authentication strategy: {}", strategy.name());

            match strategy.authenticate(handle, username).await {
                Ok(true) => {
                    debug!("Authentication succeeded with strategy: {}", strategy.name());
                    return Ok(());
                }
                Ok(false) => {
                    debug!("Authentication rejected for strategy: {}", strategy.name());
                    last_error = Some(GatewayError::SshAuthFailed(format!(
                        "{} authentication rejected",
                        strategy.name()
                    )));
                }
                Err(e) => {
                    debug!(
                        "Authentication error with strategy {}: {}",
                        strategy.name(),
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            GatewayError::SshAuthFailed("no authentication methods succeeded".to_string())
        }))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.strategies.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_tries_none_before_password() {
        let chain = AuthChain::for_password("secret");
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.strategies[0].name(), "none");
        assert_eq!(chain.strategies[1].name(), "password");
    }

    #[test]
    fn test_password_auth_name() {
        let auth = PasswordAuth::new("secret");
        assert_eq!(auth.name(), "password");
    }

    #[test]
    fn test_password_auth_stores_credentials() {
        let auth = PasswordAuth::new(String::from("p@ss with spaces"));
        assert_eq!(auth.password, "p@ss with spaces");
    }

    #[test]
    fn test_strategies_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoneAuth>();
        assert_send_sync::<PasswordAuth>();
        assert_send_sync::<AuthChain>();
    }
}
