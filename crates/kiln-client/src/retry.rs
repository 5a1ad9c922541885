use std::time::Duration;

use crate::error::ClientError;

/// Fixed-backoff retry for outbound calls. Non-2xx statuses and transport
/// errors both count as failed attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub sleep: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, sleep_sec: u64) -> Self {
        Self {
            attempts: attempts.max(1),
            sleep: Duration::from_secs(sleep_sec),
        }
    }

    /// Single attempt, no sleeping. Used by tests.
    pub fn once() -> Self {
        Self { attempts: 1, sleep: Duration::ZERO }
    }
}

/// Send the request produced by `make` until it succeeds or the policy is
/// exhausted, then surface the last failure with full context.
pub async fn send_with_retry<F>(
    policy: RetryPolicy,
    method: &str,
    url: &str,
    make: F,
) -> Result<reqwest::Response, ClientError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut last: Option<(Option<u16>, String, Option<String>)> = None;

    for attempt in 1..=policy.attempts {
        match make().send().await {
            Ok(resp) if resp.status().is_success() => return Ok(resp),
            Ok(resp) => {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                last = Some((
                    Some(status.as_u16()),
                    format!("http status {status}"),
                    Some(text),
                ));
            }
            Err(e) => {
                last = Some((e.status().map(|s| s.as_u16()), e.to_string(), None));
            }
        }
        if attempt < policy.attempts {
            tokio::time::sleep(policy.sleep).await;
        }
    }

    let (status_code, detail, response_text) =
        last.unwrap_or((None, "no attempts made".to_string(), None));
    Err(ClientError::RequestFailed {
        method: method.to_string(),
        url: url.to_string(),
        attempts: policy.attempts,
        status_code,
        detail,
        response_text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/flaky", server.uri());
        let policy = RetryPolicy { attempts: 3, sleep: Duration::ZERO };
        let resp = send_with_retry(policy, "GET", &url, || client.get(&url))
            .await
            .unwrap();
        assert_eq!(resp.text().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn terminal_failure_carries_context() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .expect(2)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/broken", server.uri());
        let policy = RetryPolicy { attempts: 2, sleep: Duration::ZERO };
        let err = send_with_retry(policy, "GET", &url, || client.get(&url))
            .await
            .unwrap_err();

        match err {
            ClientError::RequestFailed { attempts, status_code, response_text, .. } => {
                assert_eq!(attempts, 2);
                assert_eq!(status_code, Some(503));
                assert_eq!(response_text.as_deref(), Some("maintenance"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
