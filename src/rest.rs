use crate::config::RestConfig;
use crate::error::Error;
use crate::metrics::Metrics;
use crate::model::Message;
use crate::ratelimit::{RateLimiter, RestResponse, Route};
use crate::snowflake::{ChannelId, MessageId};
use crate::token::Token;
use http::header::AUTHORIZATION;
use http::Method;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

/// Response of `GET /gateway`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GatewayInfo {
    pub url: String,
}

/// Response of `GET /gateway/bot`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GatewayBotInfo {
    pub url: String,
    /// Recommended shard count
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

/// How many identifies the account may still perform
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    /// Milliseconds until `remaining` resets
    pub reset_after: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
}

fn default_max_concurrency() -> u32 {
    1
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateMessage {
    pub content: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub tts: bool,
}

impl CreateMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tts: false,
        }
    }
}

/// Window of channel history to fetch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetMessages {
    /// Messages older than this id
    pub before: Option<MessageId>,
    /// Messages newer than this id
    pub after: Option<MessageId>,
    /// 1..=100, server default 50
    pub limit: Option<u8>,
}

impl GetMessages {
    fn query(&self) -> String {
        let mut params = Vec::new();
        if let Some(before) = self.before {
            params.push(format!("before={}", before));
        }
        if let Some(after) = self.after {
            params.push(format!("after={}", after));
        }
        if let Some(limit) = self.limit {
            params.push(format!("limit={}", limit.clamp(1, 100)));
        }
        if params.is_empty() {
            String::new()
        } else {
            format!("?{}", params.join("&"))
        }
    }
}

/// REST client; every call goes through the shared [`RateLimiter`].
#[derive(Clone)]
pub struct RestClient {
    http: Client,
    config: Arc<RestConfig>,
    token: Token,
    limiter: Arc<RateLimiter>,
}

impl RestClient {
    pub fn new(token: impl Into<Token>, config: RestConfig) -> Result<Self, Error> {
        Self::with_metrics(token, config, Arc::new(Metrics::new()))
    }

    pub fn with_metrics(
        token: impl Into<Token>,
        config: RestConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Self, Error> {
        let http = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http,
            config: Arc::new(config),
            token: token.into(),
            limiter: Arc::new(RateLimiter::new().with_metrics(metrics)),
        })
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// `GET /gateway`
    pub async fn get_gateway(&self) -> Result<GatewayInfo, Error> {
        self.call(Route::new(Method::GET, "/gateway", "/gateway"), None::<&()>)
            .await
    }

    /// `GET /gateway/bot`
    pub async fn get_gateway_bot(&self) -> Result<GatewayBotInfo, Error> {
        self.call(
            Route::new(Method::GET, "/gateway/bot", "/gateway/bot"),
            None::<&()>,
        )
        .await
    }

    /// `POST /channels/{id}/messages`
    pub async fn create_message(
        &self,
        channel_id: ChannelId,
        message: &CreateMessage,
    ) -> Result<Message, Error> {
        let route = Route::new(
            Method::POST,
            "/channels/{id}/messages",
            format!("/channels/{}/messages", channel_id),
        );
        self.call(route, Some(message)).await
    }

    /// `GET /channels/{id}/messages`
    pub async fn get_messages(
        &self,
        channel_id: ChannelId,
        window: GetMessages,
    ) -> Result<Vec<Message>, Error> {
        let route = Route::new(
            Method::GET,
            "/channels/{id}/messages",
            format!("/channels/{}/messages{}", channel_id, window.query()),
        );
        self.call(route, None::<&()>).await
    }

    /// Send a request through the limiter and decode a successful body
    pub async fn call<T, B>(&self, route: Route, body: Option<&B>) -> Result<T, Error>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let response = self.request(&route, body).await?;
        if !response.is_success() {
            debug!("{} failed with {}", route, response.status);
            return Err(Error::Api {
                status: response.status,
                body: response.body,
            });
        }
        Ok(serde_json::from_str(&response.body)?)
    }

    /// Send a request through the limiter, returning any final response
    pub async fn request<B>(&self, route: &Route, body: Option<&B>) -> Result<RestResponse, Error>
    where
        B: Serialize + ?Sized,
    {
        let url = format!("{}{}", self.config.versioned_base(), route.path());
        let body = body.map(serde_json::to_value).transpose()?;

        self.limiter
            .execute(route, || {
                trace!("{} {}", route.method(), url);
                let mut request = self
                    .http
                    .request(route.method().clone(), &url)
                    .header(AUTHORIZATION, self.token.authorization());
                if let Some(body) = &body {
                    request = request.json(body);
                }
                async move {
                    let response = request.send().await?;
                    let status = response.status().as_u16();
                    let headers = response.headers().clone();
                    let body = response.text().await?;
                    Ok::<_, Error>(RestResponse {
                        status,
                        headers,
                        body,
                    })
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snowflake::Snowflake;
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve canned responses in order, recording each request line
    async fn serve(responses: Vec<String>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = seen.clone();

        tokio::spawn(async move {
            for response in responses {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                let header_end = loop {
                    let n = stream.read(&mut chunk).await.unwrap();
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos + 4;
                    }
                };
                let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
                let content_length = head
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                while buf.len() < header_end + content_length {
                    let n = stream.read(&mut chunk).await.unwrap();
                    buf.extend_from_slice(&chunk[..n]);
                }
                recorded
                    .lock()
                    .push(head.lines().next().unwrap_or_default().to_string());
                stream.write_all(response.as_bytes()).await.unwrap();
                stream.shutdown().await.unwrap();
            }
        });

        (base, seen)
    }

    fn http_response(status: &str, headers: &[(&str, &str)], body: &str) -> String {
        let mut out = format!("HTTP/1.1 {}\r\n", status);
        for (name, value) in headers {
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        out.push_str(&format!(
            "content-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        ));
        out
    }

    fn client(base: String) -> RestClient {
        let config = RestConfig {
            base_url: base,
            ..RestConfig::default()
        };
        RestClient::new(Token::bot("secret"), config).unwrap()
    }

    const MESSAGE: &str = r#"{"id":"2","channel_id":"1","author":{"id":"3","username":"bot"},"content":"pong","timestamp":"2021-01-01T00:00:00+00:00"}"#;

    #[test]
    fn test_get_messages_query() {
        let window = GetMessages {
            before: Some(Snowflake::new(10)),
            after: None,
            limit: Some(200),
        };
        assert_eq!(window.query(), "?before=10&limit=100");
        assert_eq!(GetMessages::default().query(), "");
    }

    #[tokio::test]
    async fn test_create_message_retries_after_throttle() {
        let (base, seen) = serve(vec![
            http_response(
                "429 Too Many Requests",
                &[("retry-after", "0.05")],
                r#"{"message":"You are being rate limited.","retry_after":0.05,"global":false}"#,
            ),
            http_response("200 OK", &[("x-ratelimit-remaining", "4")], MESSAGE),
        ])
        .await;
        let client = client(base);

        let message = client
            .create_message(Snowflake::new(1), &CreateMessage::new("pong"))
            .await
            .unwrap();
        assert_eq!(message.content, "pong");
        assert_eq!(
            *seen.lock(),
            vec![
                "POST /v10/channels/1/messages HTTP/1.1".to_string(),
                "POST /v10/channels/1/messages HTTP/1.1".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_api_error_surfaces_once() {
        let (base, seen) = serve(vec![http_response(
            "403 Forbidden",
            &[],
            r#"{"message":"Missing Access","code":50001}"#,
        )])
        .await;
        let client = client(base);

        let err = client
            .get_messages(
                Snowflake::new(1),
                GetMessages {
                    after: Some(Snowflake::new(5)),
                    ..GetMessages::default()
                },
            )
            .await
            .unwrap_err();
        match err {
            Error::Api { status, body } => {
                assert_eq!(status, 403);
                assert!(body.contains("Missing Access"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(
            *seen.lock(),
            vec!["GET /v10/channels/1/messages?after=5 HTTP/1.1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_get_gateway_bot() {
        let (base, _) = serve(vec![http_response(
            "200 OK",
            &[],
            r#"{"url":"wss://gateway.discord.gg","shards":4,"session_start_limit":{"total":1000,"remaining":999,"reset_after":14400000,"max_concurrency":1}}"#,
        )])
        .await;
        let client = client(base);

        let info = client.get_gateway_bot().await.unwrap();
        assert_eq!(info.shards, 4);
        assert_eq!(info.session_start_limit.remaining, 999);
    }
}
