//! HTTP transport for the InfluxDB v2 write and ping endpoints

use std::time::Duration;

use bytes::Bytes;
use reqwest::{
    StatusCode,
    header::{AUTHORIZATION, CONTENT_TYPE},
};
use tracing::debug;

/// Errors produced by [`Client`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper around [`reqwest::Error`].
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The store answered with a non-success status.
    #[error("store responded {status}: {body}")]
    Status {
        /// Response status
        status: StatusCode,
        /// Response body, as much as could be read
        body: String,
    },
}

impl Error {
    /// Whether a failed request is worth sending again. Transport failures,
    /// throttling and server errors are; anything else means the payload or
    /// credentials are wrong and will stay wrong.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
        }
    }
}

/// Connection details for [`Client`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Base URL of the store, for instance `http://influxdb:8086`
    pub url: String,
    /// API token, sent as `Authorization: Token <token>`
    pub token: String,
    /// Organization written into
    pub org: String,
    /// Bucket written into
    pub bucket: String,
    /// Per-request deadline
    pub request_timeout: Duration,
}

/// A thin InfluxDB v2 HTTP client.
///
/// Cloning is cheap, the underlying connection pool is shared.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    write_url: String,
    ping_url: String,
    token: String,
    org: String,
    bucket: String,
}

impl Client {
    /// Create a new [`Client`]
    ///
    /// # Errors
    ///
    /// Function will error if the TLS backend cannot be initialized.
    pub fn new(config: Config) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let base = config.url.trim_end_matches('/');
        Ok(Self {
            http,
            write_url: format!("{base}/api/v2/write"),
            ping_url: format!("{base}/ping"),
            token: config.token,
            org: config.org,
            bucket: config.bucket,
        })
    }

    /// POST a line protocol body. Timestamps in the body must be in seconds.
    ///
    /// # Errors
    ///
    /// Function will error if the request cannot be sent or the store does not
    /// answer with a success status.
    pub async fn write(&self, body: Bytes) -> Result<(), Error> {
        let len = body.len();
        let response = self
            .http
            .post(&self.write_url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "s"),
            ])
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(bytes = len, %status, "write accepted");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::Status { status, body })
    }

    /// Check that the store is reachable. Any HTTP answer counts as
    /// reachable; the status is returned for logging.
    ///
    /// # Errors
    ///
    /// Function will error if no HTTP answer arrives.
    pub async fn ping(&self) -> Result<StatusCode, Error> {
        let response = self.http.get(&self.ping_url).send().await?;
        Ok(response.status())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use warp::Filter;

    fn config(url: String) -> Config {
        Config {
            url,
            token: "secret".to_string(),
            org: "pcp-org".to_string(),
            bucket: "pcp-metrics".to_string(),
            request_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn write_sends_query_auth_and_body() {
        let seen: Arc<Mutex<Vec<(String, Option<String>, String)>>> = Arc::default();
        let record = Arc::clone(&seen);
        let route = warp::post()
            .and(warp::path!("api" / "v2" / "write"))
            .and(warp::query::raw())
            .and(warp::header::optional::<String>("authorization"))
            .and(warp::body::bytes())
            .map(move |query: String, auth: Option<String>, body: bytes::Bytes| {
                record.lock().expect("mutex poisoned").push((
                    query,
                    auth,
                    String::from_utf8_lossy(&body).into_owned(),
                ));
                warp::reply::with_status("", warp::http::StatusCode::NO_CONTENT)
            });
        let (addr, serve) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        let _server = tokio::spawn(serve);

        let client = Client::new(config(format!("http://{addr}/"))).expect("client");
        client
            .write(Bytes::from_static(b"m f=1 1\n"))
            .await
            .expect("write accepted");

        let seen = seen.lock().expect("mutex poisoned");
        assert_eq!(seen.len(), 1);
        let (query, auth, body) = &seen[0];
        assert_eq!(query, "org=pcp-org&bucket=pcp-metrics&precision=s");
        assert_eq!(auth.as_deref(), Some("Token secret"));
        assert_eq!(body, "m f=1 1\n");
    }

    #[tokio::test]
    async fn rejected_write_reports_status_and_body() {
        let route = warp::path!("api" / "v2" / "write").map(|| {
            warp::reply::with_status("partial write", warp::http::StatusCode::BAD_REQUEST)
        });
        let (addr, serve) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        let _server = tokio::spawn(serve);

        let client = Client::new(config(format!("http://{addr}"))).expect("client");
        let err = client
            .write(Bytes::from_static(b"bogus"))
            .await
            .expect_err("write must fail");
        match &err {
            Error::Status { status, body } => {
                assert_eq!(*status, StatusCode::BAD_REQUEST);
                assert_eq!(body, "partial write");
            }
            Error::Transport(e) => panic!("unexpected transport error {e}"),
        }
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn ping_reports_any_status() {
        let route = warp::path!("ping")
            .map(|| warp::reply::with_status("", warp::http::StatusCode::NO_CONTENT));
        let (addr, serve) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        let _server = tokio::spawn(serve);

        let client = Client::new(config(format!("http://{addr}"))).expect("client");
        assert_eq!(
            client.ping().await.expect("reachable"),
            StatusCode::NO_CONTENT
        );
    }

    #[test]
    fn retry_classification() {
        let throttled = Error::Status {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: String::new(),
        };
        let unavailable = Error::Status {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: String::new(),
        };
        let unauthorized = Error::Status {
            status: StatusCode::UNAUTHORIZED,
            body: String::new(),
        };
        assert!(throttled.is_retryable());
        assert!(unavailable.is_retryable());
        assert!(!unauthorized.is_retryable());
    }
}
