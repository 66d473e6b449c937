// Reddit API client
// Password-grant OAuth when script-app credentials are configured, the public
// JSON listings otherwise. Every request carries the configured User-Agent.

use async_trait::async_trait;
use reqwest::header::USER_AGENT;
use std::sync::Mutex;
use std::time::Duration;

use super::extract::extract_listing;
use super::models::{Listing, TokenResponse};
use super::{ContentSource, RedditError};
use crate::config::RedditConfig;
use crate::proxy::ProxyConfig;
use crate::state::QueuedPost;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RedditEndpoints {
    pub token_url: String,
    pub oauth_base: String,
    pub public_base: String,
}

impl Default for RedditEndpoints {
    fn default() -> Self {
        RedditEndpoints {
            token_url: "https://www.reddit.com/api/v1/access_token".to_string(),
            oauth_base: "https://oauth.reddit.com".to_string(),
            public_base: "https://www.reddit.com".to_string(),
        }
    }
}

pub struct RedditClient {
    http: reqwest::Client,
    config: RedditConfig,
    endpoints: RedditEndpoints,
    token: Mutex<Option<String>>,
}

impl RedditClient {
    /// Build a client, routed through `proxy` when one is given
    pub fn new(config: RedditConfig, proxy: Option<&ProxyConfig>) -> Result<Self, RedditError> {
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(proxy) = proxy {
            log::info!("Reddit requests go through {}", proxy.label);
            builder = builder.proxy(proxy.to_reqwest()?);
        }

        Ok(RedditClient {
            http: builder.build()?,
            config,
            endpoints: RedditEndpoints::default(),
            token: Mutex::new(None),
        })
    }

    pub fn with_endpoints(mut self, endpoints: RedditEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.config.credentials.is_some()
    }

    fn cached_token(&self) -> Option<String> {
        self.token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Bearer token for the OAuth API, fetched once per client
    async fn access_token(&self) -> Result<Option<String>, RedditError> {
        let Some(creds) = &self.config.credentials else {
            return Ok(None);
        };
        if let Some(token) = self.cached_token() {
            return Ok(Some(token));
        }

        let response = self
            .http
            .post(&self.endpoints.token_url)
            .header(USER_AGENT, &self.config.user_agent)
            .basic_auth(&creds.client_id, Some(&creds.client_secret))
            .form(&[
                ("grant_type", "password"),
                ("username", creds.username.as_str()),
                ("password", creds.password.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RedditError::Status {
                status: status.as_u16(),
                url: self.endpoints.token_url.clone(),
            });
        }

        let body: TokenResponse = response.json().await?;
        let token = match (body.access_token, body.error) {
            (Some(token), None) => token,
            (_, Some(error)) => return Err(RedditError::Auth(error)),
            (None, None) => return Err(RedditError::Auth("no access_token in reply".to_string())),
        };

        log::debug!("Obtained Reddit access token for u/{}", creds.username);
        *self
            .token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(token.clone());
        Ok(Some(token))
    }

    /// Raw hot listing of `subreddit`
    pub async fn hot_listing(&self, subreddit: &str, limit: u32) -> Result<Listing, RedditError> {
        let token = self.access_token().await?;

        let url = match token {
            Some(_) => format!("{}/r/{}/hot", self.endpoints.oauth_base, subreddit),
            None => format!("{}/r/{}/hot.json", self.endpoints.public_base, subreddit),
        };

        let mut request = self
            .http
            .get(&url)
            .header(USER_AGENT, &self.config.user_agent)
            .query(&[("limit", limit.to_string()), ("raw_json", "1".to_string())]);
        if let Some(token) = &token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RedditError::Status {
                status: status.as_u16(),
                url,
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl ContentSource for RedditClient {
    async fn fetch_hot(&self, subreddit: &str, limit: u32) -> Result<Vec<QueuedPost>, RedditError> {
        let listing = self.hot_listing(subreddit, limit).await?;
        let posts = extract_listing(&listing, subreddit);
        log::info!(
            "Fetched {} posts from r/{} ({} usable)",
            listing.data.children.len(),
            subreddit,
            posts.len()
        );
        Ok(posts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedditCredentials;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn endpoints(server: &MockServer) -> RedditEndpoints {
        RedditEndpoints {
            token_url: format!("{}/api/v1/access_token", server.uri()),
            oauth_base: server.uri(),
            public_base: server.uri(),
        }
    }

    fn hot_body() -> serde_json::Value {
        json!({
            "kind": "Listing",
            "data": {
                "children": [
                    { "kind": "t3", "data": { "id": "s1", "title": "Rules", "stickied": true } },
                    {
                        "kind": "t3",
                        "data": {
                            "id": "p1",
                            "title": "Clip",
                            "permalink": "/r/Overwatch/comments/p1/clip/"
                        }
                    }
                ]
            }
        })
    }

    #[tokio::test]
    async fn test_public_listing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/r/Overwatch/hot.json"))
            .and(query_param("limit", "25"))
            .and(query_param("raw_json", "1"))
            .and(header("user-agent", "relay-test/1.0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(hot_body()))
            .expect(1)
            .mount(&server)
            .await;

        let config = RedditConfig {
            user_agent: "relay-test/1.0".to_string(),
            credentials: None,
        };
        let client = RedditClient::new(config, None)
            .unwrap()
            .with_endpoints(endpoints(&server));

        let posts = client.fetch_hot("Overwatch", 25).await.unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].id, "p1");
        assert_eq!(posts[0].subreddit, "Overwatch");
    }

    #[tokio::test]
    async fn test_password_grant_then_oauth_listing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/access_token"))
            .and(body_string_contains("grant_type=password"))
            .and(body_string_contains("username=relaybot"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "tok123",
                "token_type": "bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/r/Overwatch/hot"))
            .and(header("authorization", "Bearer tok123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(hot_body()))
            .expect(2)
            .mount(&server)
            .await;

        let config = RedditConfig {
            user_agent: "relay-test/1.0".to_string(),
            credentials: Some(RedditCredentials {
                client_id: "cid".to_string(),
                client_secret: "csecret".to_string(),
                username: "relaybot".to_string(),
                password: "pw".to_string(),
            }),
        };
        let client = RedditClient::new(config, None)
            .unwrap()
            .with_endpoints(endpoints(&server));

        assert!(client.is_authenticated());
        client.fetch_hot("Overwatch", 10).await.unwrap();
        // Second call reuses the cached token
        let posts = client.fetch_hot("Overwatch", 10).await.unwrap();
        assert_eq!(posts[0].id, "p1");
    }

    #[tokio::test]
    async fn test_invalid_grant_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/access_token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "error": "invalid_grant" })),
            )
            .mount(&server)
            .await;

        let config = RedditConfig {
            user_agent: "relay-test/1.0".to_string(),
            credentials: Some(RedditCredentials {
                client_id: "cid".to_string(),
                client_secret: "csecret".to_string(),
                username: "relaybot".to_string(),
                password: "wrong".to_string(),
            }),
        };
        let client = RedditClient::new(config, None)
            .unwrap()
            .with_endpoints(endpoints(&server));

        match client.fetch_hot("Overwatch", 10).await {
            Err(RedditError::Auth(reason)) => assert_eq!(reason, "invalid_grant"),
            other => panic!("unexpected: {:?}", other.map(|p| p.len())),
        }
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/r/private/hot.json"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let config = RedditConfig {
            user_agent: "relay-test/1.0".to_string(),
            credentials: None,
        };
        let client = RedditClient::new(config, None)
            .unwrap()
            .with_endpoints(endpoints(&server));

        match client.fetch_hot("private", 10).await {
            Err(RedditError::Status { status, .. }) => assert_eq!(status, 403),
            other => panic!("unexpected: {:?}", other.map(|p| p.len())),
        }
    }
}
