//! HS256 bearer tokens with a rolling window of active signing secrets.

use std::time::Duration;

use anyhow::{bail, Result};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
pub const ROTATION_NEEDED_AGE: Duration = Duration::from_secs(24 * 3600);
pub const SECRET_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 3600);
pub const MAX_ACTIVE_SECRETS: usize = 3;

struct SecretEntry {
    id: String,
    secret: Vec<u8>,
    created_at: Instant,
}

impl SecretEntry {
    fn new(secret: Vec<u8>) -> Self {
        let id = short_id(&secret);
        Self {
            id,
            secret,
            created_at: Instant::now(),
        }
    }
}

fn short_id(secret: &[u8]) -> String {
    secret
        .iter()
        .take(4)
        .map(|b| format!("{b:02x}"))
        .collect::<String>()
}

/// The claims carried in an issued token.
#[derive(Debug, Clone)]
pub struct TokenSubject {
    pub id: String,
    pub username: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    display_name: Option<String>,
    iat: i64,
    exp: i64,
    /// 4-char prefix of the signing secret's id — a debugging hint, not a
    /// trust decision; verification still tries every active secret.
    kid: String,
}

#[derive(Debug, Clone)]
pub struct TokenServiceStatus {
    pub active_count: usize,
    pub current_age: Duration,
    pub current_id_prefix: String,
    pub rotation_needed: bool,
}

/// Issues and verifies bearer tokens, rotating the signing secret without
/// invalidating tokens signed under a still-fresh previous one.
pub struct TokenService {
    secrets: Mutex<Vec<SecretEntry>>,
    ttl: Duration,
}

impl TokenService {
    pub fn new(master_secret: Vec<u8>, previous_secret: Option<Vec<u8>>) -> Self {
        let mut secrets = vec![SecretEntry::new(master_secret)];
        if let Some(previous) = previous_secret {
            secrets.push(SecretEntry::new(previous));
        }
        Self {
            secrets: Mutex::new(secrets),
            ttl: DEFAULT_TOKEN_TTL,
        }
    }

    fn generate_secret() -> Vec<u8> {
        let mut bytes = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes
    }

    pub async fn issue(&self, subject: TokenSubject) -> Result<String> {
        let secrets = self.secrets.lock().await;
        let Some(newest) = secrets.first() else {
            bail!("token service has no active signing secret");
        };

        let now = chrono_like_now();
        let claims = Claims {
            sub: subject.id,
            username: subject.username,
            display_name: subject.display_name,
            iat: now,
            exp: now + self.ttl.as_secs() as i64,
            kid: newest.id.chars().take(4).collect(),
        };

        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&newest.secret),
        )?;
        Ok(token)
    }

    /// Verify against every active secret, newest first. Returns `None`
    /// (never an error) on expiry, tamper, or unknown-secret mismatch.
    pub async fn verify(&self, token: &str) -> Option<TokenSubject> {
        let secrets = self.secrets.lock().await;
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        for entry in secrets.iter() {
            let key = DecodingKey::from_secret(&entry.secret);
            if let Ok(data) = decode::<Claims>(token, &key, &validation) {
                return Some(TokenSubject {
                    id: data.claims.sub,
                    username: data.claims.username,
                    display_name: data.claims.display_name,
                });
            }
        }
        None
    }

    /// Prepend a fresh random secret, trim the window to 3, drop anything
    /// older than 7 days (the newest entry is never dropped).
    pub async fn rotate(&self) -> String {
        let mut secrets = self.secrets.lock().await;
        let fresh = SecretEntry::new(Self::generate_secret());
        let id = fresh.id.clone();
        secrets.insert(0, fresh);
        secrets.truncate(MAX_ACTIVE_SECRETS);
        secrets.retain(|e| e.created_at.elapsed() < SECRET_MAX_AGE);
        if secrets.is_empty() {
            unreachable!("the just-inserted secret cannot have aged out");
        }
        id
    }

    /// Rotate automatically if the newest secret is older than 24 h.
    pub async fn maybe_rotate(&self) -> bool {
        let needs_rotation = {
            let secrets = self.secrets.lock().await;
            secrets
                .first()
                .map(|e| e.created_at.elapsed() > ROTATION_NEEDED_AGE)
                .unwrap_or(true)
        };
        if needs_rotation {
            self.rotate().await;
        }
        needs_rotation
    }

    pub async fn status(&self) -> TokenServiceStatus {
        let secrets = self.secrets.lock().await;
        let current_age = secrets
            .first()
            .map(|e| e.created_at.elapsed())
            .unwrap_or_default();
        let current_id_prefix = secrets.first().map(|e| e.id.clone()).unwrap_or_default();
        TokenServiceStatus {
            active_count: secrets.len(),
            current_age,
            current_id_prefix,
            rotation_needed: current_age > ROTATION_NEEDED_AGE,
        }
    }
}

/// Seconds since the Unix epoch. `std::time::SystemTime` rather than
/// `tokio::time::Instant` because JWT `iat`/`exp` are wall-clock, not
/// monotonic — unlike the rotation ages above, which only ever compare
/// against other `Instant`s taken in this process.
fn chrono_like_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new(b"a master secret at least 32 bytes long!".to_vec(), None)
    }

    fn subject() -> TokenSubject {
        TokenSubject {
            id: "42".into(),
            username: "alice".into(),
            display_name: Some("Alice".into()),
        }
    }

    #[tokio::test]
    async fn verify_issue_roundtrip() {
        let svc = service();
        let token = svc.issue(subject()).await.unwrap();
        let verified = svc.verify(&token).await.unwrap();
        assert_eq!(verified.id, "42");
        assert_eq!(verified.username, "alice");
    }

    #[tokio::test]
    async fn tampered_token_fails_verify() {
        let svc = service();
        let mut token = svc.issue(subject()).await.unwrap();
        token.push('x');
        assert!(svc.verify(&token).await.is_none());
    }

    #[tokio::test]
    async fn rotate_keeps_old_tokens_verifiable() {
        let svc = service();
        let token = svc.issue(subject()).await.unwrap();
        svc.rotate().await;
        assert!(svc.verify(&token).await.is_some());
    }

    #[tokio::test]
    async fn rotate_trims_to_three_active_secrets() {
        let svc = service();
        svc.rotate().await;
        svc.rotate().await;
        svc.rotate().await;
        svc.rotate().await;
        let status = svc.status().await;
        assert_eq!(status.active_count, MAX_ACTIVE_SECRETS);
    }

    #[tokio::test(start_paused = true)]
    async fn maybe_rotate_is_noop_before_24h() {
        let svc = service();
        assert!(!svc.maybe_rotate().await);
    }

    #[tokio::test(start_paused = true)]
    async fn maybe_rotate_fires_after_24h() {
        let svc = service();
        tokio::time::advance(Duration::from_secs(25 * 3600)).await;
        assert!(svc.maybe_rotate().await);
        let status = svc.status().await;
        assert!(!status.rotation_needed);
    }

    #[tokio::test]
    async fn bootstrap_with_previous_secret_verifies_tokens_signed_by_it() {
        let previous = b"a previous secret that is also long enough".to_vec();
        let svc_old = TokenService::new(previous.clone(), None);
        let token = svc_old.issue(subject()).await.unwrap();

        let svc_new = TokenService::new(
            b"a brand new master secret thats long enough".to_vec(),
            Some(previous),
        );
        assert!(svc_new.verify(&token).await.is_some());
    }
}
