use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey,
                   Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// HS256 shared secret, cheap to clone into handlers.
#[derive(Clone)]
pub struct Secret(Arc<str>);

impl Secret {
    pub fn new(s:&str) -> Self { Self(Arc::from(s)) }
    pub fn as_str(&self) -> &str { &self.0 }
}

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("missing credential")]
    Missing,
    #[error("invalid credential: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
    #[error("credential carries no user id")]
    NoSubject,
}

/// `sub` (or the legacy `user_id`) may be a string or a number.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Value>,
    pub exp: i64,
}

impl Claims {
    pub fn user(&self) -> Option<String> {
        [&self.sub, &self.user_id].into_iter().flatten().find_map(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n)                  => Some(n.to_string()),
            _                                 => None,
        })
    }
}

pub fn sign(uid:&str, secret:&str) -> Result<String, AuthError> {
    let c = Claims { sub: Some(uid.into()), user_id: None, exp: Utc::now().timestamp()+86_400 };
    Ok(encode(&Header::default(), &c, &EncodingKey::from_secret(secret.as_bytes()))?)
}

/// Verifies the HS256 signature and expiry, returning the user id.
pub fn verify(token:Option<&str>, secret:&str) -> Result<String, AuthError> {
    let token = token.filter(|t| !t.is_empty()).ok_or(AuthError::Missing)?;
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()),
                                &Validation::new(Algorithm::HS256))?;
    data.claims.user().ok_or(AuthError::NoSubject)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_token_round_trips_to_user() {
        let t = sign("42", "s3cret").unwrap();
        assert_eq!(verify(Some(&t), "s3cret").unwrap(), "42");
    }

    #[test]
    fn wrong_secret_fails_closed() {
        let t = sign("42", "s3cret").unwrap();
        assert!(matches!(verify(Some(&t), "other"), Err(AuthError::Invalid(_))));
    }

    #[test]
    fn missing_or_garbage_token() {
        assert!(matches!(verify(None, "s"), Err(AuthError::Missing)));
        assert!(matches!(verify(Some(""), "s"), Err(AuthError::Missing)));
        assert!(matches!(verify(Some("not.a.jwt"), "s"), Err(AuthError::Invalid(_))));
    }

    #[test]
    fn numeric_user_id_claim_is_accepted() {
        let c = Claims { sub: None, user_id: Some(7.into()), exp: Utc::now().timestamp() + 60 };
        let t = encode(&Header::default(), &c, &EncodingKey::from_secret(b"k")).unwrap();
        assert_eq!(verify(Some(&t), "k").unwrap(), "7");
    }

    #[test]
    fn token_without_subject() {
        let c = Claims { sub: None, user_id: None, exp: Utc::now().timestamp() + 60 };
        let t = encode(&Header::default(), &c, &EncodingKey::from_secret(b"k")).unwrap();
        assert!(matches!(verify(Some(&t), "k"), Err(AuthError::NoSubject)));
    }
}
