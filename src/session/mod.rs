//! Session payload handed to the browser on the first request and replayed on
//! socket join.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{LiveError, LiveResult};

/// `{csrf_token, data}`; immutable once issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub csrf_token: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Session {
    pub fn new() -> Self {
        Self::with_data(Map::new())
    }

    pub fn with_data(data: Map<String, Value>) -> Self {
        Self {
            csrf_token: Uuid::new_v4().as_simple().to_string(),
            data,
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque signing capability: turn a session into a token and back.
#[async_trait]
pub trait SessionSerializer: Send + Sync {
    async fn serialize(&self, session: &Session) -> LiveResult<String>;
    async fn deserialize(&self, token: &str) -> LiveResult<Session>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    session: Session,
    exp: i64,
    iat: i64,
}

/// HS256 JWT signer.
#[derive(Clone)]
pub struct JwtSessionSerializer {
    secret: String,
    ttl: Duration,
}

impl JwtSessionSerializer {
    pub fn new(secret: String) -> Self {
        Self {
            secret,
            ttl: Duration::days(1),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

#[async_trait]
impl SessionSerializer for JwtSessionSerializer {
    async fn serialize(&self, session: &Session) -> LiveResult<String> {
        let now = Utc::now();
        let claims = Claims {
            session: session.clone(),
            exp: (now + self.ttl).timestamp(),
            iat: now.timestamp(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| LiveError::Session(e.to_string()))
    }

    async fn deserialize(&self, token: &str) -> LiveResult<Session> {
        let mut validation = Validation::default();
        validation.validate_exp = true;
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|e| LiveError::Session(e.to_string()))?;
        Ok(data.claims.session)
    }
}
