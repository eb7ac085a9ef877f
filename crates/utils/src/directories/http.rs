use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::{debug, error, info};
use url::Url;

use crate::alias::{AliasDirectory, AliasRecord, LookupError, LookupFuture};

/// Alias directory served by the remote alias API.
///
/// Every lookup is a `GET {base}/aliases/{address}` authenticated with a
/// bearer token. Anything other than `200 OK` means the alias has no mapping.
pub struct HttpAliasDirectory {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpAliasDirectory {
    /// Creates a new [`HttpAliasDirectory`] for the given API base URL.
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, LookupError> {
        let base_url = Url::parse(base_url).map_err(|e| {
            error!(url = %base_url, error = %e, "Invalid alias API URL");
            LookupError::Transport(format!("Invalid alias API URL: {e}"))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(LookupError::Transport(format!(
                "Alias API URL cannot be a base: {base_url}"
            )));
        }
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            LookupError::Transport(format!("Failed to create HTTP client: {e}"))
        })?;
        info!(url = %base_url, "HTTP alias directory initialized");
        Ok(Self {
            client,
            base_url,
            token: token.filter(|token| !token.is_empty()),
        })
    }

    /// Builds the lookup endpoint for an address, the address is a single
    /// percent-encoded path segment.
    pub fn endpoint(&self, address: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("aliases").push(address);
        }
        url
    }
}

impl AliasDirectory for HttpAliasDirectory {
    fn lookup<'a>(&'a self, address: &'a str) -> LookupFuture<'a> {
        Box::pin(async move {
            let url = self.endpoint(address);
            debug!(url = %url, "Looking up alias");

            let mut request = self.client.get(url);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| LookupError::Transport(e.to_string()))?;

            if response.status() != StatusCode::OK {
                debug!(
                    recipient = %address,
                    status = response.status().as_u16(),
                    "Alias API returned no mapping"
                );
                return Ok(None);
            }

            let record = response
                .json::<AliasRecord>()
                .await
                .map_err(|e| LookupError::Decode(e.to_string()))?;
            Ok(Some(record))
        })
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory(base: &str) -> HttpAliasDirectory {
        HttpAliasDirectory::new(base, Some("secret".to_string()), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_endpoint_appends_alias_path() {
        let directory = directory("https://api.example.com/v1");
        assert_eq!(
            directory.endpoint("info@example.com").as_str(),
            "https://api.example.com/v1/aliases/info@example.com"
        );
    }

    #[test]
    fn test_endpoint_trailing_slash() {
        let directory = directory("https://api.example.com/v1/");
        assert_eq!(
            directory.endpoint("info@example.com").as_str(),
            "https://api.example.com/v1/aliases/info@example.com"
        );
    }

    #[test]
    fn test_endpoint_encodes_path_separators() {
        let directory = directory("https://api.example.com");
        assert_eq!(
            directory.endpoint("a/b@example.com").as_str(),
            "https://api.example.com/aliases/a%2Fb@example.com"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(HttpAliasDirectory::new("not a url", None, Duration::from_secs(1)).is_err());
        assert!(HttpAliasDirectory::new("mailto:a@b.c", None, Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_api_is_transport_error() {
        let directory = HttpAliasDirectory::new(
            "http://127.0.0.1:9",
            None,
            Duration::from_millis(500),
        )
        .unwrap();
        match directory.lookup("info@example.com").await {
            Err(LookupError::Transport(_)) => {}
            other => panic!("Expected transport error, got {other:?}"),
        }
    }
}
