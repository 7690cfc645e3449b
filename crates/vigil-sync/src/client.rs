//! HTTPS client for the remote API: basic auth, JSON bodies, paginated
//! lists.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("api: transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("api: authentication failed (status {status})")]
    Auth { status: u16 },
    #[error("api: unexpected status {status} for {path}: {body}")]
    Status {
        status: u16,
        path: String,
        body: String,
    },
    #[error("api: undecodable response for {path}: {source}")]
    Decode {
        path: String,
        source: serde_json::Error,
    },
}

impl ApiError {
    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::Auth { .. })
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
    #[serde(default)]
    next: Option<String>,
}

pub struct ApiClient {
    base_url: String,
    username: String,
    password: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str, username: &str, password: &str) -> Result<ApiClient> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(ApiClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn handle<T: DeserializeOwned>(path: &str, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ApiError::Auth {
                status: status.as_u16(),
            });
        }
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                path: path.to_string(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(|source| ApiError::Decode {
            path: path.to_string(),
            source,
        })
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(self.url(path))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        Self::handle(path, response).await
    }

    /// GET a paginated collection, following `next` links.
    pub async fn list<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<Vec<T>> {
        let mut results = Vec::new();
        let mut request = self
            .http
            .get(self.url(path))
            .query(params)
            .basic_auth(&self.username, Some(&self.password));
        loop {
            let response = request.send().await?;
            let page: Page<T> = Self::handle(path, response).await?;
            results.extend(page.results);
            match page.next {
                Some(next) if !next.is_empty() => {
                    request = self
                        .http
                        .get(next)
                        .basic_auth(&self.username, Some(&self.password));
                }
                _ => return Ok(results),
            }
        }
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self
            .http
            .post(self.url(path))
            .basic_auth(&self.username, Some(&self.password))
            .json(body)
            .send()
            .await?;
        Self::handle(path, response).await
    }

    pub async fn put<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self
            .http
            .put(self.url(path))
            .basic_auth(&self.username, Some(&self.password))
            .json(body)
            .send()
            .await?;
        Self::handle(path, response).await
    }

    pub async fn patch<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self
            .http
            .patch(self.url(path))
            .basic_auth(&self.username, Some(&self.password))
            .json(body)
            .send()
            .await?;
        Self::handle(path, response).await
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(path))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ApiError::Auth {
                status: status.as_u16(),
            });
        }
        if !status.is_success() && status.as_u16() != 404 {
            return Err(ApiError::Status {
                status: status.as_u16(),
                path: path.to_string(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// POST with one-off credentials, returning the response status too.
    /// Used for registration, which authenticates with the account's
    /// registration key instead of the agent credentials.
    pub async fn post_with_credentials<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        username: &str,
        password: &str,
    ) -> Result<(u16, T)> {
        let response = self
            .http
            .post(self.url(path))
            .basic_auth(username, Some(password))
            .json(body)
            .send()
            .await?;
        let status = response.status().as_u16();
        let value = Self::handle(path, response).await?;
        Ok((status, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_are_distinguished() {
        let auth = ApiError::Auth { status: 401 };
        assert!(auth.is_auth());
        let other = ApiError::Status {
            status: 500,
            path: "v1/agent/".to_string(),
            body: String::new(),
        };
        assert!(!other.is_auth());
    }

    #[test]
    fn page_decoding_tolerates_missing_fields() {
        let page: Page<String> = serde_json::from_str(r#"{"results": ["a", "b"]}"#).unwrap();
        assert_eq!(page.results.len(), 2);
        assert!(page.next.is_none());

        let page: Page<String> = serde_json::from_str("{}").unwrap();
        assert!(page.results.is_empty());
    }
}
