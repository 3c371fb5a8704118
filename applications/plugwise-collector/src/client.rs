//! HTTP access to the Stretch and Smile gateways.

use crate::error::AppError;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

pub const STRETCH_APPLIANCES: &str = "/core/appliances";
pub const STRETCH_MODULES: &str = "/core/modules";
pub const SMILE_DOMAIN_OBJECTS: &str = "/core/domain_objects";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEndpoint {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub enabled: bool,
}

impl DeviceEndpoint {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.host, self.port, path)
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// A single authenticated GET. Implemented by `HttpTransport` and by test fakes.
pub trait Transport {
    fn get(
        &self,
        url: &str,
        username: &str,
        password: &str,
    ) -> impl Future<Output = Result<HttpResponse, AppError>>;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, AppError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    async fn get(&self, url: &str, username: &str, password: &str) -> Result<HttpResponse, AppError> {
        let response = self
            .client
            .get(url)
            .basic_auth(username, Some(password))
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(HttpResponse { status, body })
    }
}

/// Bounded retry: at most `max_attempts` tries with `backoff` between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Run `op` until it succeeds or the attempts are used up.
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, FetchFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    debug!(attempt, max_attempts = self.max_attempts, error = %e, "attempt failed");
                    last_error = Some(e);
                }
            }
            if attempt < self.max_attempts && !self.backoff.is_zero() {
                tokio::time::sleep(self.backoff).await;
            }
        }
        Err(FetchFailure {
            attempts: self.max_attempts,
            last_error,
        })
    }
}

/// Returned once every attempt has failed. Not fatal: the caller skips this
/// endpoint for the current cycle.
#[derive(Debug)]
pub struct FetchFailure {
    pub attempts: u32,
    /// `None` when the endpoint is disabled and nothing was attempted
    pub last_error: Option<AppError>,
}

impl std::fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.last_error {
            Some(e) => write!(f, "failed after {} attempt(s): {}", self.attempts, e),
            None => write!(f, "endpoint disabled"),
        }
    }
}

impl std::error::Error for FetchFailure {}

pub struct DeviceClient<T> {
    transport: T,
    retry: RetryPolicy,
}

impl<T: Transport> DeviceClient<T> {
    pub fn new(transport: T, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    /// GET `path` from the endpoint and return the body of a 200 response.
    pub async fn fetch(&self, endpoint: &DeviceEndpoint, path: &str) -> Result<String, FetchFailure> {
        if !endpoint.enabled {
            return Err(FetchFailure {
                attempts: 0,
                last_error: None,
            });
        }

        let url = endpoint.url(path);
        self.retry
            .run(|attempt| {
                let url = url.as_str();
                async move {
                    debug!(device = %endpoint.name, url, attempt, "fetching");
                    let response = self
                        .transport
                        .get(url, &endpoint.username, &endpoint.password)
                        .await?;
                    if response.status == 200 {
                        Ok(response.body)
                    } else {
                        Err(AppError::Status {
                            status: response.status,
                        })
                    }
                }
            })
            .await
    }
}
