/// Credential provider module
///
/// The auth token is owned by an external credential store; the monitor only
/// asks for the current value before every recognizer call.

use parking_lot::RwLock;

/// Source of the current authentication token
pub trait TokenProvider: Send + Sync {
    /// Current token, or `None` when the user is signed out
    fn token(&self) -> Option<String>;
}

/// Token held in memory and replaceable at runtime (sign-in / sign-out)
#[derive(Debug, Default)]
pub struct StaticTokenProvider {
    token: RwLock<Option<String>>,
}

impl StaticTokenProvider {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    pub fn set(&self, token: Option<String>) {
        *self.token.write() = token;
    }
}

impl TokenProvider for StaticTokenProvider {
    fn token(&self) -> Option<String> {
        self.token.read().clone()
    }
}

/// Token read from an environment variable on every call
#[derive(Debug, Clone)]
pub struct EnvTokenProvider {
    var: String,
}

impl EnvTokenProvider {
    pub const DEFAULT_VAR: &'static str = "DISTRESS_AUTH_TOKEN";

    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvTokenProvider {
    fn default() -> Self {
        Self::new(Self::DEFAULT_VAR)
    }
}

impl TokenProvider for EnvTokenProvider {
    fn token(&self) -> Option<String> {
        std::env::var(&self.var)
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }
}
