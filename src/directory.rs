//! User directory client: `GET {API_BASE}/user/{id}`.
use std::{sync::Arc, time::Duration};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::warn;

use crate::protocol::UserProfile;

#[derive(thiserror::Error, Debug)]
pub enum DirectoryErr {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("directory answered {0}")]
    Status(reqwest::StatusCode),
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn lookup(&self, user_id: &str, credential: &str) -> Result<UserProfile, DirectoryErr>;
}

pub type Directory = Arc<dyn UserDirectory>;

/// Lookup that never fails: directory errors degrade to a placeholder profile.
pub async fn resolve(dir: &dyn UserDirectory, user_id: &str, credential: &str) -> UserProfile {
    match dir.lookup(user_id, credential).await {
        Ok(mut user) => {
            user.strip_reserved();
            user
        }
        Err(e) => {
            warn!(user_id, error = %e, "directory lookup failed, using placeholder");
            UserProfile::placeholder(user_id)
        }
    }
}

/* ------------ HTTP 實作 ------------ */
pub struct HttpDirectory {
    client: Client,
    base:   String,
}

impl HttpDirectory {
    pub fn new(base: &str, timeout: Duration) -> Result<Self, DirectoryErr> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base: base.trim_end_matches('/').to_string() })
    }
}

/// The account service wraps the profile in `{"user": ...}`; bare profiles are accepted too.
#[derive(Deserialize)]
#[serde(untagged)]
enum ProfileBody {
    Wrapped { user: UserProfile },
    Bare(UserProfile),
}

#[async_trait]
impl UserDirectory for HttpDirectory {
    async fn lookup(&self, user_id: &str, credential: &str) -> Result<UserProfile, DirectoryErr> {
        let url = format!("{}/user/{}", self.base, user_id);
        let resp = self.client.get(&url).bearer_auth(credential).send().await?;
        if !resp.status().is_success() {
            return Err(DirectoryErr::Status(resp.status()));
        }
        match resp.json::<ProfileBody>().await? {
            ProfileBody::Wrapped { user } | ProfileBody::Bare(user) => Ok(user),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::{matchers::{header, method, path}, Mock, MockServer, ResponseTemplate};

    fn dir(server: &MockServer) -> HttpDirectory {
        HttpDirectory::new(&server.uri(), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn bare_profile_is_returned() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user/42"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "42", "name": "Ada", "email": "ada@example.com",
                "profile": null, "created_at": "2024-01-01T00:00:00Z"
            })))
            .mount(&server)
            .await;

        let user = dir(&server).lookup("42", "tok").await.unwrap();
        assert_eq!(user.name, "Ada");
        assert_eq!(user.email.as_deref(), Some("ada@example.com"));
    }

    #[tokio::test]
    async fn wrapped_profile_is_unwrapped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user/9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "user": {"id": "9", "name": "Bo", "email": null, "profile": "https://img/9.png"}
            })))
            .mount(&server)
            .await;

        let user = dir(&server).lookup("9", "tok").await.unwrap();
        assert_eq!(user.name, "Bo");
        assert_eq!(user.profile.as_deref(), Some("https://img/9.png"));
    }

    #[tokio::test]
    async fn failure_degrades_to_placeholder() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let d = dir(&server);
        assert!(matches!(d.lookup("5", "tok").await, Err(DirectoryErr::Status(_))));

        let user = resolve(&d, "5", "tok").await;
        assert_eq!(user.id, "5");
        assert_eq!(user.name, "User 5");
        assert!(user.email.is_none());
    }
}
