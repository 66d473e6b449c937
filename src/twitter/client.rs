// X API client
// v1.1 media upload (simple and chunked) and v2 tweet creation, OAuth 1.0a signed

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::AUTHORIZATION;
use reqwest::multipart::{Form, Part};
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;

use super::oauth1::OAuth1Signer;
use super::rate_limit::{endpoint_limit, resource_of, retry_after_from_headers, wait_needed};
use super::{Publisher, TwitterError};
use crate::config::TwitterCredentials;

pub const MEDIA_UPLOAD_ENDPOINT: &str = "/media/upload";
pub const TWEET_ENDPOINT: &str = "/tweets&POST";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const CHUNK_SIZE: u64 = 4 * 1024 * 1024;
const MAX_STATUS_POLLS: u32 = 60;
const DEFAULT_CHECK_AFTER_SECS: u64 = 5;
const VIDEO_MEDIA_TYPE: &str = "video/mp4";
const VIDEO_CATEGORY: &str = "tweet_video";

#[derive(Debug, Clone)]
pub struct TwitterEndpoints {
    pub api_base: String,
    pub upload_url: String,
}

impl Default for TwitterEndpoints {
    fn default() -> Self {
        TwitterEndpoints {
            api_base: "https://api.twitter.com".to_string(),
            upload_url: "https://upload.twitter.com/1.1/media/upload.json".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MediaUploadResponse {
    media_id_string: String,
    #[serde(default)]
    processing_info: Option<ProcessingInfo>,
}

#[derive(Debug, Deserialize)]
struct ProcessingInfo {
    state: String,
    #[serde(default)]
    check_after_secs: Option<u64>,
    #[serde(default)]
    error: Option<ProcessingError>,
}

#[derive(Debug, Deserialize)]
struct ProcessingError {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateTweetResponse {
    data: TweetData,
}

#[derive(Debug, Deserialize)]
struct TweetData {
    id: String,
}

enum RequestBody {
    Empty,
    Json(serde_json::Value),
    Multipart(Form),
}

pub struct TwitterClient {
    http: reqwest::Client,
    signer: OAuth1Signer,
    endpoints: TwitterEndpoints,
    rate_limit_buffer: i64,
    max_rate_limit_wait: Duration,
}

impl TwitterClient {
    pub fn new(credentials: TwitterCredentials) -> Result<Self, TwitterError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(TwitterClient {
            http,
            signer: OAuth1Signer::new(credentials),
            endpoints: TwitterEndpoints::default(),
            rate_limit_buffer: 10,
            max_rate_limit_wait: Duration::from_secs(300),
        })
    }

    pub fn with_endpoints(mut self, endpoints: TwitterEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Requests left at or below `buffer` trigger a wait; waits longer than
    /// `max_wait` fail instead
    pub fn with_rate_limits(mut self, buffer: i64, max_wait: Duration) -> Self {
        self.rate_limit_buffer = buffer;
        self.max_rate_limit_wait = max_wait;
        self
    }

    async fn send_signed(
        &self,
        method: Method,
        url: &str,
        query: &[(String, String)],
        body: RequestBody,
    ) -> Result<Response, TwitterError> {
        let auth = self.signer.authorization_header(method.as_str(), url, query)?;
        let mut request = self.http.request(method, url).header(AUTHORIZATION, auth);
        if !query.is_empty() {
            request = request.query(query);
        }
        request = match body {
            RequestBody::Empty => request,
            RequestBody::Json(value) => request.json(&value),
            RequestBody::Multipart(form) => request.multipart(form),
        };

        let response = request.send().await?;
        check_status(response).await
    }

    /// Raw v1.1 `application/rate_limit_status` for a comma separated list
    /// of resource families
    pub async fn rate_limit_status(
        &self,
        resources: &str,
    ) -> Result<serde_json::Value, TwitterError> {
        let url = format!("{}/1.1/application/rate_limit_status.json", self.endpoints.api_base);
        let query = vec![("resources".to_string(), resources.to_string())];
        let response = self.send_signed(Method::GET, &url, &query, RequestBody::Empty).await?;
        Ok(response.json().await?)
    }

    /// Sleep until the window resets when `endpoint` is close to its limit.
    /// Failing to read the limits is not fatal.
    pub async fn check_rate_limits(&self, endpoint: &str) -> Result<(), TwitterError> {
        let Some(resource) = resource_of(endpoint) else {
            log::warn!("Cannot derive rate limit resource from {}", endpoint);
            return Ok(());
        };

        let status = match self.rate_limit_status(resource).await {
            Ok(status) => status,
            Err(e) => {
                log::error!("Error checking rate limits for {}: {}", endpoint, e);
                return Ok(());
            }
        };

        let Some(limit) = endpoint_limit(&status, endpoint) else {
            log::warn!("No rate limit entry for {}", endpoint);
            return Ok(());
        };
        log::info!(
            "Rate limit for {}: {}/{} remaining",
            endpoint,
            limit.remaining,
            limit.limit
        );

        if let Some(wait) = wait_needed(&limit, Utc::now().timestamp(), self.rate_limit_buffer) {
            if wait > self.max_rate_limit_wait {
                return Err(TwitterError::RateLimited {
                    retry_after_secs: wait.as_secs(),
                });
            }
            log::warn!(
                "Approaching rate limit for {}. Sleeping for {} seconds.",
                endpoint,
                wait.as_secs()
            );
            tokio::time::sleep(wait).await;
        }
        Ok(())
    }

    /// Simple (single request) upload for images
    pub async fn upload_image(&self, path: &Path) -> Result<String, TwitterError> {
        self.check_rate_limits(MEDIA_UPLOAD_ENDPOINT).await?;

        let bytes = tokio::fs::read(path).await?;
        let form = Form::new().part("media", Part::bytes(bytes).file_name(file_name(path)));
        let response = self
            .send_signed(
                Method::POST,
                &self.endpoints.upload_url,
                &[],
                RequestBody::Multipart(form),
            )
            .await?;
        let upload: MediaUploadResponse = response.json().await?;

        log::info!("Uploaded image {} as media {}", path.display(), upload.media_id_string);
        Ok(upload.media_id_string)
    }

    /// Chunked INIT/APPEND/FINALIZE upload, then wait for server-side processing
    pub async fn upload_video(&self, path: &Path) -> Result<String, TwitterError> {
        self.check_rate_limits(MEDIA_UPLOAD_ENDPOINT).await?;

        let mut file = tokio::fs::File::open(path).await?;
        let total_bytes = file.metadata().await?.len();
        if total_bytes == 0 {
            return Err(TwitterError::Upload(format!("{} is empty", path.display())));
        }

        let init = vec![
            ("command".to_string(), "INIT".to_string()),
            ("total_bytes".to_string(), total_bytes.to_string()),
            ("media_type".to_string(), VIDEO_MEDIA_TYPE.to_string()),
            ("media_category".to_string(), VIDEO_CATEGORY.to_string()),
        ];
        let response = self
            .send_signed(Method::POST, &self.endpoints.upload_url, &init, RequestBody::Empty)
            .await?;
        let media_id = response.json::<MediaUploadResponse>().await?.media_id_string;
        log::info!("Initialized video upload {} ({} bytes)", media_id, total_bytes);

        let name = file_name(path);
        let mut segment_index = 0u32;
        loop {
            let mut chunk = Vec::new();
            (&mut file).take(CHUNK_SIZE).read_to_end(&mut chunk).await?;
            if chunk.is_empty() {
                break;
            }

            let append = vec![
                ("command".to_string(), "APPEND".to_string()),
                ("media_id".to_string(), media_id.clone()),
                ("segment_index".to_string(), segment_index.to_string()),
            ];
            let form = Form::new().part("media", Part::bytes(chunk).file_name(name.clone()));
            self.send_signed(
                Method::POST,
                &self.endpoints.upload_url,
                &append,
                RequestBody::Multipart(form),
            )
            .await?;
            segment_index += 1;
        }

        let finalize = vec![
            ("command".to_string(), "FINALIZE".to_string()),
            ("media_id".to_string(), media_id.clone()),
        ];
        let response = self
            .send_signed(Method::POST, &self.endpoints.upload_url, &finalize, RequestBody::Empty)
            .await?;
        let finalized: MediaUploadResponse = response.json().await?;

        self.wait_for_processing(&media_id, finalized.processing_info)
            .await?;
        log::info!(
            "Uploaded video {} as media {} in {} segments",
            path.display(),
            media_id,
            segment_index
        );
        Ok(media_id)
    }

    async fn wait_for_processing(
        &self,
        media_id: &str,
        initial: Option<ProcessingInfo>,
    ) -> Result<(), TwitterError> {
        let mut info = initial;

        for _ in 0..MAX_STATUS_POLLS {
            let Some(current) = info else {
                return Ok(());
            };

            match current.state.as_str() {
                "succeeded" => return Ok(()),
                "failed" => {
                    let message = current
                        .error
                        .and_then(|e| e.message)
                        .unwrap_or_else(|| "processing failed".to_string());
                    return Err(TwitterError::Upload(format!("media {}: {}", media_id, message)));
                }
                state => {
                    let wait = current.check_after_secs.unwrap_or(DEFAULT_CHECK_AFTER_SECS);
                    log::info!("Media {} is {}, checking again in {}s", media_id, state, wait);
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                }
            }

            let status = vec![
                ("command".to_string(), "STATUS".to_string()),
                ("media_id".to_string(), media_id.to_string()),
            ];
            let response = self
                .send_signed(Method::GET, &self.endpoints.upload_url, &status, RequestBody::Empty)
                .await?;
            info = response.json::<MediaUploadResponse>().await?.processing_info;
        }

        Err(TwitterError::Upload(format!(
            "media {} still processing after {} status checks",
            media_id, MAX_STATUS_POLLS
        )))
    }

    /// `POST /2/tweets`, returning the new tweet's id
    pub async fn create_tweet(
        &self,
        text: &str,
        media_ids: &[String],
    ) -> Result<String, TwitterError> {
        self.check_rate_limits(TWEET_ENDPOINT).await?;

        let mut body = serde_json::json!({ "text": text });
        if !media_ids.is_empty() {
            body["media"] = serde_json::json!({ "media_ids": media_ids });
        }

        let url = format!("{}/2/tweets", self.endpoints.api_base);
        let response = self
            .send_signed(Method::POST, &url, &[], RequestBody::Json(body))
            .await?;
        let created: CreateTweetResponse = response.json().await?;

        log::info!("Tweet posted successfully: {}", created.data.id);
        Ok(created.data.id)
    }
}

#[async_trait]
impl Publisher for TwitterClient {
    async fn upload_image(&self, path: &Path) -> Result<String, TwitterError> {
        TwitterClient::upload_image(self, path).await
    }

    async fn upload_video(&self, path: &Path) -> Result<String, TwitterError> {
        TwitterClient::upload_video(self, path).await
    }

    async fn create_tweet(&self, text: &str, media_ids: &[String]) -> Result<String, TwitterError> {
        TwitterClient::create_tweet(self, text, media_ids).await
    }
}

async fn check_status(response: Response) -> Result<Response, TwitterError> {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = retry_after_from_headers(response.headers(), Utc::now().timestamp());
        return Err(TwitterError::RateLimited { retry_after_secs });
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TwitterError::Api {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "media".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{body_partial_json, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(server: &MockServer) -> TwitterClient {
        let credentials = TwitterCredentials {
            consumer_key: "ck".to_string(),
            consumer_secret: "cs".to_string(),
            access_token: "at".to_string(),
            access_token_secret: "ats".to_string(),
        };
        TwitterClient::new(credentials)
            .unwrap()
            .with_endpoints(TwitterEndpoints {
                api_base: server.uri(),
                upload_url: format!("{}/1.1/media/upload.json", server.uri()),
            })
    }

    async fn mount_rate_limits(server: &MockServer, body: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/1.1/application/rate_limit_status.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_create_tweet_with_media() {
        let server = MockServer::start().await;
        mount_rate_limits(&server, json!({ "resources": {} })).await;
        Mock::given(method("POST"))
            .and(path("/2/tweets"))
            .and(header_exists("authorization"))
            .and(body_partial_json(json!({
                "text": "hello",
                "media": { "media_ids": ["111", "222"] }
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "data": { "id": "999", "text": "hello" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server);
        let id = client
            .create_tweet("hello", &["111".to_string(), "222".to_string()])
            .await
            .unwrap();
        assert_eq!(id, "999");
    }

    #[tokio::test]
    async fn test_create_tweet_429_is_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/1.1/application/rate_limit_status.json"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let reset = Utc::now().timestamp() + 60;
        Mock::given(method("POST"))
            .and(path("/2/tweets"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("x-rate-limit-reset", reset.to_string().as_str()),
            )
            .mount(&server)
            .await;

        let client = test_client(&server);
        match client.create_tweet("hello", &[]).await {
            Err(TwitterError::RateLimited { retry_after_secs }) => {
                assert!(retry_after_secs <= 60 && retry_after_secs >= 55)
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_api_error_keeps_body() {
        let server = MockServer::start().await;
        mount_rate_limits(&server, json!({})).await;
        Mock::given(method("POST"))
            .and(path("/2/tweets"))
            .respond_with(ResponseTemplate::new(403).set_body_string("duplicate content"))
            .mount(&server)
            .await;

        let client = test_client(&server);
        match client.create_tweet("hello", &[]).await {
            Err(TwitterError::Api { status, body }) => {
                assert_eq!(status, 403);
                assert_eq!(body, "duplicate content");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rate_limit_far_reset_fails() {
        let server = MockServer::start().await;
        let reset = Utc::now().timestamp() + 3600;
        mount_rate_limits(
            &server,
            json!({
                "resources": {
                    "media": {
                        "/media/upload": { "limit": 500, "remaining": 2, "reset": reset }
                    }
                }
            }),
        )
        .await;

        let client = test_client(&server);
        let result = client.check_rate_limits(MEDIA_UPLOAD_ENDPOINT).await;
        assert!(matches!(result, Err(ref e) if e.is_rate_limited()));
    }

    #[tokio::test]
    async fn test_rate_limit_short_wait_sleeps() {
        let server = MockServer::start().await;
        let reset = Utc::now().timestamp() + 1;
        mount_rate_limits(
            &server,
            json!({
                "resources": {
                    "media": {
                        "/media/upload": { "limit": 500, "remaining": 0, "reset": reset }
                    }
                }
            }),
        )
        .await;

        let client = test_client(&server);
        client.check_rate_limits(MEDIA_UPLOAD_ENDPOINT).await.unwrap();
    }

    #[tokio::test]
    async fn test_rate_limit_lookup_failure_ignored() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/1.1/application/rate_limit_status.json"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = test_client(&server);
        client.check_rate_limits(TWEET_ENDPOINT).await.unwrap();
    }

    #[tokio::test]
    async fn test_upload_image() {
        let server = MockServer::start().await;
        mount_rate_limits(&server, json!({})).await;
        Mock::given(method("POST"))
            .and(path("/1.1/media/upload.json"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "media_id": 710511363345354753u64,
                "media_id_string": "710511363345354753"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let image = temp_dir.path().join("pic.jpg");
        std::fs::write(&image, b"jpeg bytes").unwrap();

        let client = test_client(&server);
        assert_eq!(client.upload_image(&image).await.unwrap(), "710511363345354753");
    }

    #[tokio::test]
    async fn test_chunked_video_upload() {
        let server = MockServer::start().await;
        mount_rate_limits(&server, json!({})).await;
        Mock::given(method("POST"))
            .and(path("/1.1/media/upload.json"))
            .and(query_param("command", "INIT"))
            .and(query_param("media_category", "tweet_video"))
            .and(query_param("total_bytes", "11"))
            .respond_with(
                ResponseTemplate::new(202).set_body_json(json!({ "media_id_string": "42" })),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/1.1/media/upload.json"))
            .and(query_param("command", "APPEND"))
            .and(query_param("media_id", "42"))
            .and(query_param("segment_index", "0"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/1.1/media/upload.json"))
            .and(query_param("command", "FINALIZE"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "media_id_string": "42",
                "processing_info": { "state": "pending", "check_after_secs": 0 }
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/1.1/media/upload.json"))
            .and(query_param("command", "STATUS"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "media_id_string": "42",
                "processing_info": { "state": "succeeded", "progress_percent": 100 }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let video = temp_dir.path().join("clip.mp4");
        std::fs::write(&video, b"video bytes").unwrap();

        let client = test_client(&server);
        assert_eq!(client.upload_video(&video).await.unwrap(), "42");
    }

    #[tokio::test]
    async fn test_video_processing_failure() {
        let server = MockServer::start().await;
        mount_rate_limits(&server, json!({})).await;
        Mock::given(method("POST"))
            .and(path("/1.1/media/upload.json"))
            .and(query_param("command", "INIT"))
            .respond_with(
                ResponseTemplate::new(202).set_body_json(json!({ "media_id_string": "7" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/1.1/media/upload.json"))
            .and(query_param("command", "APPEND"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/1.1/media/upload.json"))
            .and(query_param("command", "FINALIZE"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "media_id_string": "7",
                "processing_info": {
                    "state": "failed",
                    "error": { "code": 1, "name": "InvalidMedia", "message": "Unsupported video" }
                }
            })))
            .mount(&server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let video = temp_dir.path().join("bad.mp4");
        std::fs::write(&video, b"not a video").unwrap();

        let client = test_client(&server);
        match client.upload_video(&video).await {
            Err(TwitterError::Upload(message)) => assert!(message.contains("Unsupported video")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_video_rejected() {
        let server = MockServer::start().await;
        mount_rate_limits(&server, json!({})).await;

        let temp_dir = TempDir::new().unwrap();
        let video = temp_dir.path().join("empty.mp4");
        std::fs::write(&video, b"").unwrap();

        let client = test_client(&server);
        assert!(matches!(
            client.upload_video(&video).await,
            Err(TwitterError::Upload(_))
        ));
    }
}
