//! Caller identity.
//!
//! Every command endpoint resolves an [`Identity`] before touching the
//! engine. The resolved `actor_id` is what lands in the audit trail.

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::error::ApiError;
use crate::server::AppState;

/// Header trusted for the actor id in development mode.
pub const ACTOR_HEADER: &str = "x-actor-id";

/// What a caller is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Raises and cancels alerts
    Reporter,
    /// Acknowledges and resolves assigned alerts
    Responder,
    /// Escalates, archives and re-dispatches
    Dispatcher,
    /// Reads the audit ledger
    Operator,
    /// Roster sync: registers responders and sets availability
    Roster,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Reporter,
        Role::Responder,
        Role::Dispatcher,
        Role::Operator,
        Role::Roster,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reporter => "reporter",
            Self::Responder => "responder",
            Self::Dispatcher => "dispatcher",
            Self::Operator => "operator",
            Self::Roster => "roster",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reporter" => Ok(Self::Reporter),
            "responder" => Ok(Self::Responder),
            "dispatcher" => Ok(Self::Dispatcher),
            "operator" => Ok(Self::Operator),
            "roster" => Ok(Self::Roster),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub actor_id: String,
    pub roles: BTreeSet<Role>,
}

impl Identity {
    pub fn new(actor_id: impl Into<String>, roles: impl IntoIterator<Item = Role>) -> Self {
        Self {
            actor_id: actor_id.into(),
            roles: roles.into_iter().collect(),
        }
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Fail with 403 unless the caller holds `role`.
    pub fn require(&self, role: Role) -> Result<(), ApiError> {
        if self.has_role(role) {
            Ok(())
        } else {
            Err(ApiError::forbidden(format!(
                "{} lacks the {} role",
                self.actor_id, role
            )))
        }
    }
}

/// Resolves request headers to a caller.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn identify(&self, headers: &HeaderMap) -> Result<Identity, ApiError>;
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Fixed bearer-token table loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenProvider {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }

    /// Build from `token=actor:role,role` entries.
    pub fn from_entries<I, S>(entries: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut provider = Self::new();
        for entry in entries {
            let (token, identity) = parse_token_entry(entry.as_ref())?;
            if provider.tokens.contains_key(&token) {
                return Err(format!("token for {} is defined twice", identity.actor_id));
            }
            provider.tokens.insert(token, identity);
        }
        Ok(provider)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl IdentityProvider for StaticTokenProvider {
    async fn identify(&self, headers: &HeaderMap) -> Result<Identity, ApiError> {
        let token = bearer_token(headers)
            .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| ApiError::unauthorized("unknown bearer token"))
    }
}

/// Parse one `token=actor:role,role` entry.
pub fn parse_token_entry(entry: &str) -> Result<(String, Identity), String> {
    let (token, rest) = entry
        .split_once('=')
        .ok_or_else(|| format!("expected token=actor:roles, got {:?}", entry))?;
    let (actor, roles) = rest
        .split_once(':')
        .ok_or_else(|| format!("expected actor:roles after token, got {:?}", rest))?;

    let token = token.trim();
    let actor = actor.trim();
    if token.is_empty() || actor.is_empty() {
        return Err(format!("empty token or actor in {:?}", entry));
    }

    let roles = roles
        .split(',')
        .filter(|r| !r.trim().is_empty())
        .map(Role::from_str)
        .collect::<Result<BTreeSet<_>, _>>()?;
    if roles.is_empty() {
        return Err(format!("no roles for actor {}", actor));
    }

    Ok((
        token.to_string(),
        Identity {
            actor_id: actor.to_string(),
            roles,
        },
    ))
}

/// Trusts `X-Actor-Id` and grants every role. Development only.
#[derive(Debug, Clone, Default)]
pub struct DevModeProvider;

#[async_trait]
impl IdentityProvider for DevModeProvider {
    async fn identify(&self, headers: &HeaderMap) -> Result<Identity, ApiError> {
        let actor = headers
            .get(ACTOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::unauthorized("missing X-Actor-Id header"))?;
        Ok(Identity::new(actor, Role::ALL))
    }
}

#[axum::async_trait]
impl FromRequestParts<AppState> for Identity {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        state.identity.identify(&parts.headers).await
    }
}
