//! About-account lookup over HTTP, backed by `ureq`.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde_json::Value;

use crate::config::NetworkConfig;
use crate::error::FetchError;
use crate::lookup::ProfileFetcher;
use crate::protocol::ProfileLocation;

const RATE_LIMIT_ERROR_CODE: i64 = 88;

/// Runs the blocking HTTP call on the runtime's blocking pool.
pub struct HttpProfileFetcher {
    http_client: ureq::Agent,
    config: NetworkConfig,
}

impl HttpProfileFetcher {
    pub fn new(config: NetworkConfig) -> Self {
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout(Duration::from_millis(config.timeout_ms))
            .build();
        Self {
            http_client,
            config,
        }
    }

    fn request_url(endpoint: &str, handle: &str) -> String {
        let variables = serde_json::json!({ "screenName": handle }).to_string();
        format!(
            "{}?variables={}",
            endpoint.trim().trim_end_matches('?'),
            urlencoding::encode(&variables)
        )
    }

    fn fetch_blocking(
        http_client: &ureq::Agent,
        config: &NetworkConfig,
        handle: &str,
    ) -> Result<ProfileLocation, FetchError> {
        let url = Self::request_url(&config.endpoint, handle);
        let mut request = http_client
            .get(&url)
            .set("Accept", "application/json")
            .set("x-twitter-active-user", "yes")
            .set("x-twitter-client-language", "en");
        if !config.bearer_token.is_empty() {
            request = request.set("Authorization", &bearer_header(&config.bearer_token));
        }
        if !config.csrf_token.is_empty() {
            request = request.set("x-csrf-token", &config.csrf_token);
        }
        if !config.cookie.is_empty() {
            request = request.set("Cookie", &config.cookie);
        }

        let response = request.call().map_err(classify_ureq_failure)?;
        let body = response
            .into_string()
            .map_err(|error| FetchError::Transport(format!("Failed to read response: {error}")))?;
        decode_about_response(handle, &body)
    }
}

fn bearer_header(token: &str) -> String {
    if token.starts_with("Bearer ") {
        token.to_string()
    } else {
        format!("Bearer {token}")
    }
}

fn classify_ureq_failure(error: ureq::Error) -> FetchError {
    match error {
        ureq::Error::Status(429, _) => FetchError::RateLimited,
        ureq::Error::Status(code, response) => {
            // Some throttling answers arrive with another status but a rate-limit body.
            let body = response.into_string().unwrap_or_default();
            if body_signals_rate_limit(&body) {
                FetchError::RateLimited
            } else {
                FetchError::Transport(format!("HTTP status {code}"))
            }
        }
        ureq::Error::Transport(transport) => {
            FetchError::Transport(format!("Request failed: {transport}"))
        }
    }
}

fn body_signals_rate_limit(body: &str) -> bool {
    serde_json::from_str::<Value>(body)
        .ok()
        .is_some_and(|value| errors_signal_rate_limit(&value))
}

fn errors_signal_rate_limit(value: &Value) -> bool {
    value
        .get("errors")
        .and_then(Value::as_array)
        .is_some_and(|errors| {
            errors.iter().any(|error| {
                error.get("code").and_then(Value::as_i64) == Some(RATE_LIMIT_ERROR_CODE)
                    || error
                        .get("message")
                        .and_then(Value::as_str)
                        .is_some_and(|message| message.to_ascii_lowercase().contains("rate limit"))
            })
        })
}

/// Decodes an about-account response body into the boundary result.
pub fn decode_about_response(handle: &str, body: &str) -> Result<ProfileLocation, FetchError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|error| FetchError::Decode(format!("Invalid JSON response: {error}")))?;
    if errors_signal_rate_limit(&value) {
        return Err(FetchError::RateLimited);
    }

    let result = value.pointer("/data/user_result_by_screen_name/result");
    if result.is_none() && value.get("errors").is_some() {
        return Err(FetchError::Decode(format!(
            "Response carried errors and no profile: {}",
            value["errors"]
        )));
    }
    let canonical = result
        .and_then(|result| result.pointer("/core/screen_name"))
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .unwrap_or(handle);
    let raw_location = result
        .and_then(|result| result.pointer("/about_profile/account_based_in"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|location| !location.is_empty())
        .map(str::to_string);

    Ok(ProfileLocation {
        handle: canonical.to_string(),
        raw_location,
    })
}

#[async_trait(?Send)]
impl ProfileFetcher for HttpProfileFetcher {
    async fn fetch_location(&self, handle: &str) -> Result<ProfileLocation, FetchError> {
        debug!("Enrichment[@{}]: requesting about-account profile", handle);
        let http_client = self.http_client.clone();
        let config = self.config.clone();
        let handle = handle.to_string();
        tokio::task::spawn_blocking(move || Self::fetch_blocking(&http_client, &config, &handle))
            .await
            .map_err(|error| FetchError::Transport(format!("Lookup task failed: {error}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::{bearer_header, classify_ureq_failure, decode_about_response, HttpProfileFetcher};
    use crate::error::FetchError;

    #[test]
    fn test_decode_reads_location_and_canonical_name() {
        let body = r#"{"data":{"user_result_by_screen_name":{"result":{
            "core":{"screen_name":"Alice"},
            "about_profile":{"account_based_in":"Tokyo, Japan"}}}}}"#;

        let location = decode_about_response("alice", body).expect("profile should decode");
        assert_eq!(location.handle, "Alice");
        assert_eq!(location.raw_location.as_deref(), Some("Tokyo, Japan"));
    }

    #[test]
    fn test_decode_missing_region_is_successful_empty_result() {
        let body = r#"{"data":{"user_result_by_screen_name":{"result":{"about_profile":{}}}}}"#;

        let location = decode_about_response("bob", body).expect("profile should decode");
        assert_eq!(location.handle, "bob");
        assert_eq!(location.raw_location, None);

        let empty = decode_about_response("bob", r#"{"data":{}}"#).expect("empty data decodes");
        assert_eq!(empty.raw_location, None);
    }

    #[test]
    fn test_decode_classifies_rate_limit_errors() {
        let by_code = r#"{"errors":[{"code":88,"message":"Slow down"}]}"#;
        let by_message = r#"{"errors":[{"message":"Rate limit exceeded"}]}"#;

        assert_eq!(decode_about_response("carol", by_code), Err(FetchError::RateLimited));
        assert_eq!(decode_about_response("carol", by_message), Err(FetchError::RateLimited));
    }

    #[test]
    fn test_decode_rejects_malformed_and_error_only_bodies() {
        assert!(matches!(
            decode_about_response("dave", "<html>"),
            Err(FetchError::Decode(_))
        ));
        assert!(matches!(
            decode_about_response("dave", r#"{"errors":[{"message":"csrf mismatch"}]}"#),
            Err(FetchError::Decode(_))
        ));
    }

    #[test]
    fn test_request_url_encodes_variables() {
        let url = HttpProfileFetcher::request_url("https://example.test/q", "alice");
        assert_eq!(
            url,
            "https://example.test/q?variables=%7B%22screenName%22%3A%22alice%22%7D"
        );
    }

    #[test]
    fn test_bearer_header_adds_scheme_once() {
        assert_eq!(bearer_header("abc"), "Bearer abc");
        assert_eq!(bearer_header("Bearer abc"), "Bearer abc");
    }

    fn status_error(status: u16, status_text: &str, body: &str) -> ureq::Error {
        let response =
            ureq::Response::new(status, status_text, body).expect("response should build");
        ureq::Error::Status(status, response)
    }

    #[test]
    fn test_http_429_is_rate_limited() {
        let error = status_error(429, "Too Many Requests", "");
        assert_eq!(classify_ureq_failure(error), FetchError::RateLimited);
    }

    #[test]
    fn test_other_status_with_rate_limit_body_is_rate_limited() {
        let error = status_error(403, "Forbidden", r#"{"errors":[{"code":88}]}"#);
        assert_eq!(classify_ureq_failure(error), FetchError::RateLimited);
    }

    #[test]
    fn test_plain_server_error_is_transport_failure() {
        let error = status_error(500, "Internal Server Error", "oops");
        assert_eq!(
            classify_ureq_failure(error),
            FetchError::Transport("HTTP status 500".to_string())
        );
    }
}
