//! Idempotency tokens for retried commands.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DispatchError, Result};
use crate::types::Alert;

/// Token and request fingerprint carried in the audit payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub token: String,
    pub fingerprint: String,
}

/// A command that completed under a token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedCommand {
    pub fingerprint: String,
    pub result: Alert,
}

#[derive(Debug, Clone)]
enum TokenState {
    InFlight { fingerprint: String },
    Done(CompletedCommand),
}

/// Outcome of reserving a token.
#[derive(Debug)]
pub enum Reservation<'a> {
    /// First use; run the command and settle the claim
    Fresh(TokenClaim<'a>),
    /// Same token and parameters already succeeded
    Replay(Alert),
}

/// An in-flight token. Dropping it unsettled frees the token again.
#[derive(Debug)]
pub struct TokenClaim<'a> {
    cache: &'a IdempotencyCache,
    token: String,
    fingerprint: String,
    settled: bool,
}

impl TokenClaim<'_> {
    /// Record the outcome. Failures free the token.
    pub fn settle(mut self, outcome: &Result<Alert>) {
        self.settled = true;
        match outcome {
            Ok(alert) => {
                self.cache.tokens.insert(
                    self.token.clone(),
                    TokenState::Done(CompletedCommand {
                        fingerprint: self.fingerprint.clone(),
                        result: alert.clone(),
                    }),
                );
            }
            Err(_) => self.cache.release(&self.token),
        }
    }
}

impl Drop for TokenClaim<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!(token = %self.token, "Token claim abandoned");
            self.cache.release(&self.token);
        }
    }
}

/// Fingerprint of a command: name, target and arguments.
pub fn fingerprint(command: &str, alert_id: &str, args: &[&str]) -> String {
    let mut fp = format!("{}|{}", command, alert_id);
    for arg in args {
        fp.push('|');
        fp.push_str(&arg.len().to_string());
        fp.push(':');
        fp.push_str(arg);
    }
    fp
}

/// Token table. Callers reserve under the target alert's lock.
#[derive(Debug, Default)]
pub struct IdempotencyCache {
    tokens: DashMap<String, TokenState>,
}

impl IdempotencyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `token` for a command with `fingerprint`.
    pub fn reserve(&self, token: &str, fingerprint: &str) -> Result<Reservation<'_>> {
        if token.trim().is_empty() {
            return Err(DispatchError::InvalidRequest(
                "idempotency token must not be empty".to_string(),
            ));
        }

        match self.tokens.entry(token.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(TokenState::InFlight {
                    fingerprint: fingerprint.to_string(),
                });
                Ok(Reservation::Fresh(TokenClaim {
                    cache: self,
                    token: token.to_string(),
                    fingerprint: fingerprint.to_string(),
                    settled: false,
                }))
            }
            Entry::Occupied(slot) => match slot.get() {
                TokenState::Done(done) if done.fingerprint == fingerprint => {
                    Ok(Reservation::Replay(done.result.clone()))
                }
                _ => Err(DispatchError::DuplicateRequest(token.to_string())),
            },
        }
    }

    fn release(&self, token: &str) {
        self.tokens
            .remove_if(token, |_, state| matches!(state, TokenState::InFlight { .. }));
    }

    /// Seed a completed command, e.g. from ledger replay.
    pub fn restore(&self, token: String, command: CompletedCommand) {
        self.tokens.insert(token, TokenState::Done(command));
    }

    /// Completed commands, for comparison against replay.
    pub fn completed(&self) -> Vec<(String, CompletedCommand)> {
        self.tokens
            .iter()
            .filter_map(|e| match e.value() {
                TokenState::Done(done) => Some((e.key().clone(), done.clone())),
                TokenState::InFlight { .. } => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle;
    use crate::types::{AlertKind, NewAlert};
    use chrono::Utc;

    fn claim<'a>(cache: &'a IdempotencyCache, token: &str, fp: &str) -> TokenClaim<'a> {
        match cache.reserve(token, fp).unwrap() {
            Reservation::Fresh(claim) => claim,
            Reservation::Replay(_) => panic!("expected fresh claim"),
        }
    }

    fn alert() -> Alert {
        lifecycle::report(
            "alert-1".to_string(),
            NewAlert::new(AlertKind::Hazard, "reporter-1"),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_replay_after_success() {
        let cache = IdempotencyCache::new();
        let fp = fingerprint("cancel", "alert-1", &["false alarm"]);

        match cache.reserve("tok-1", &fp).unwrap() {
            Reservation::Fresh(claim) => claim.settle(&Ok(alert())),
            Reservation::Replay(_) => panic!("expected fresh claim"),
        }

        match cache.reserve("tok-1", &fp).unwrap() {
            Reservation::Replay(prior) => assert_eq!(prior.id, "alert-1"),
            Reservation::Fresh(_) => panic!("expected replay"),
        };
    }

    #[test]
    fn test_different_parameters_rejected() {
        let cache = IdempotencyCache::new();
        let fp = fingerprint("cancel", "alert-1", &["false alarm"]);
        claim(&cache, "tok-1", &fp).settle(&Ok(alert()));

        let other = fingerprint("cancel", "alert-1", &["duplicate"]);
        assert!(matches!(
            cache.reserve("tok-1", &other),
            Err(DispatchError::DuplicateRequest(_))
        ));
    }

    #[test]
    fn test_failure_frees_token() {
        let cache = IdempotencyCache::new();
        let fp = fingerprint("resolve", "alert-1", &["done"]);
        claim(&cache, "tok-1", &fp).settle(&Err(DispatchError::AlertNotFound("alert-1".into())));

        assert!(matches!(cache.reserve("tok-1", &fp).unwrap(), Reservation::Fresh(_)));
        assert!(cache.completed().is_empty());
    }

    #[test]
    fn test_in_flight_token_rejects_concurrent_use() {
        let cache = IdempotencyCache::new();
        let fp = fingerprint("acknowledge", "alert-1", &["responder-1"]);
        let _held = claim(&cache, "tok-1", &fp);

        assert!(matches!(
            cache.reserve("tok-1", &fp),
            Err(DispatchError::DuplicateRequest(_))
        ));
    }

    #[test]
    fn test_abandoned_claim_frees_token() {
        let cache = IdempotencyCache::new();
        let fp = fingerprint("cancel", "alert-1", &["false alarm"]);
        drop(claim(&cache, "tok-1", &fp));

        let retry = claim(&cache, "tok-1", &fp);
        retry.settle(&Ok(alert()));
        assert_eq!(cache.completed().len(), 1);
    }

    #[test]
    fn test_fingerprint_field_boundaries() {
        assert_ne!(
            fingerprint("resolve", "a", &["b|c"]),
            fingerprint("resolve", "a", &["b", "c"])
        );
    }
}
