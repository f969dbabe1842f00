use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};

use super::{ActiveTasks, ChangeTicketResolver};
use crate::error::BastionError;

/// Change-ticket resolver over HTTP.
///
/// `GET {endpoint}/active-tasks?config_item=..&assignee=..` answering with
/// an [`ActiveTasks`] JSON body.
pub struct HttpTicketResolver {
    client: reqwest::Client,
    endpoint: Url,
    token: Option<SecretString>,
}

impl std::fmt::Debug for HttpTicketResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTicketResolver")
            .field("endpoint", &self.endpoint.as_str())
            .field("token", &self.token.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

impl HttpTicketResolver {
    pub fn new(
        endpoint: &str,
        token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, BastionError> {
        let mut base = endpoint.trim().to_owned();
        if !base.ends_with('/') {
            base.push('/');
        }
        let endpoint = Url::parse(&base)
            .and_then(|u| u.join("active-tasks"))
            .map_err(|e| BastionError::validation("tickets.endpoint", e.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BastionError::Unavailable(format!("ticket client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            token,
        })
    }
}

#[async_trait]
impl ChangeTicketResolver for HttpTicketResolver {
    async fn active_tasks(
        &self,
        config_item: &str,
        subject_external_id: &str,
    ) -> Result<ActiveTasks, BastionError> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("config_item", config_item)
            .append_pair("assignee", subject_external_id);

        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| BastionError::Unavailable(format!("ticket system: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(BastionError::Unavailable(format!(
                "ticket system returned {status}"
            )));
        }
        response
            .json::<ActiveTasks>()
            .await
            .map_err(|e| BastionError::Unavailable(format!("ticket system body: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fetches_active_tasks() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/active-tasks"))
            .and(query_param("config_item", "CI0001"))
            .and(query_param("assignee", "u-1001"))
            .and(header("authorization", "Bearer s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": false,
                "changeRequestNumber": "CHG0001",
                "validUntil": "2026-03-02T00:00:00Z",
                "tasks": [{"taskNumber": "CTASK1", "description": "web ops", "assignedTo": []}]
            })))
            .mount(&server)
            .await;

        let resolver = HttpTicketResolver::new(
            &format!("{}/api", server.uri()),
            Some(SecretString::from("s3cret".to_owned())),
            Duration::from_secs(5),
        )
        .unwrap();
        let tasks = resolver.active_tasks("CI0001", "u-1001").await.unwrap();
        assert_eq!(tasks.change_request_number.as_deref(), Some("CHG0001"));
        assert_eq!(tasks.tasks.len(), 1);
    }

    #[tokio::test]
    async fn server_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let resolver =
            HttpTicketResolver::new(&server.uri(), None, Duration::from_secs(5)).unwrap();
        let err = resolver.active_tasks("CI0001", "u1").await.unwrap_err();
        assert!(matches!(err, BastionError::Unavailable(_)), "got: {err}");
    }

    #[tokio::test]
    async fn malformed_body_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let resolver =
            HttpTicketResolver::new(&server.uri(), None, Duration::from_secs(5)).unwrap();
        let err = resolver.active_tasks("CI0001", "u1").await.unwrap_err();
        assert!(matches!(err, BastionError::Unavailable(_)));
    }

    #[test]
    fn invalid_endpoint_is_a_validation_error() {
        let err = HttpTicketResolver::new("not a url", None, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(
            err,
            BastionError::Validation {
                field: "tickets.endpoint",
                ..
            }
        ));
    }
}
