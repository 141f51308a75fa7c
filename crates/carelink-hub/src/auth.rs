use crate::error::ConfigError;
use axum::http::{header::AUTHORIZATION, HeaderMap};
use carelink_core::Principal;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    #[serde(flatten)]
    pub principal: Principal,
}

#[derive(Debug, Clone, Deserialize)]
struct TokenFile {
    tokens: Vec<TokenEntry>,
}

/// Maps issued session tokens to principals. Issuance itself happens elsewhere.
#[derive(Debug, Clone, Default)]
pub struct TokenTable {
    by_token: HashMap<String, Principal>,
}

impl TokenTable {
    pub fn from_entries(entries: impl IntoIterator<Item = TokenEntry>) -> Self {
        let mut table = Self::default();
        for entry in entries {
            table.insert(entry.token, entry.principal);
        }
        table
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let file: TokenFile = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::from_entries(file.tokens))
    }

    pub fn insert(&mut self, token: impl Into<String>, principal: Principal) {
        let token = token.into();
        if token.trim().is_empty() {
            return;
        }
        self.by_token.insert(token, principal);
    }

    pub fn resolve(&self, token: &str) -> Option<&Principal> {
        self.by_token.get(token)
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}
