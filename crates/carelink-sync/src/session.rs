//! Where the push channel and API client get the current session token.

use std::sync::{Arc, RwLock};

pub trait SessionTokenProvider: Send + Sync + 'static {
    /// The current token, or `None` when signed out. Empty strings count as none.
    fn current_token(&self) -> Option<String>;
}

/// A token fixed at construction; typically from a flag or environment variable.
#[derive(Clone)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

impl SessionTokenProvider for StaticToken {
    fn current_token(&self) -> Option<String> {
        normalize(self.0.clone())
    }
}

/// A token that login, refresh and logout can swap out while channels are live.
#[derive(Clone, Default)]
pub struct SharedToken {
    inner: Arc<RwLock<Option<String>>>,
}

impl SharedToken {
    pub fn new(token: Option<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(token)),
        }
    }

    pub fn set(&self, token: impl Into<String>) {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(token.into());
    }

    pub fn clear(&self) {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = None;
    }
}

impl SessionTokenProvider for SharedToken {
    fn current_token(&self) -> Option<String> {
        let guard = match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        normalize(guard.clone())
    }
}

fn normalize(token: Option<String>) -> Option<String> {
    token
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
