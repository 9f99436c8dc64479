use std::time::Duration;

use orakle_protocol::skill_wire::{CapabilitiesResponse, RunRequest, RunResult};
use tracing::warn;

use crate::descriptor::SkillDescriptor;
use crate::error::SkillsError;

/// C1: discovers and invokes skills hosted on one or more remote servers.
/// Servers are tried in configured priority order; there is no load
/// balancing, only fallback (§4.2, §9).
pub struct SkillRegistryClient {
    servers: Vec<String>,
    http: reqwest::Client,
}

impl SkillRegistryClient {
    pub fn new(servers: Vec<String>, timeout_secs: u64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("reqwest client builds with a plain timeout");
        Self { servers, http }
    }

    /// Fetches the manifest from the first server that responds, in
    /// configured priority order (§4.2).
    pub async fn capabilities(&self) -> Result<Vec<SkillDescriptor>, SkillsError> {
        let mut last_error = String::from("no skill servers configured");

        for server in &self.servers {
            let url = format!("{}/capabilities", server.trim_end_matches('/'));
            match self.http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    match resp.json::<CapabilitiesResponse>().await {
                        Ok(manifest) => {
                            return Ok(manifest
                                .into_iter()
                                .map(|(name, entry)| SkillDescriptor::from_manifest_entry(&name, entry))
                                .collect());
                        }
                        Err(e) => {
                            last_error = format!("{server}: malformed manifest ({e})");
                            warn!(server, error = %e, "skill server returned an unparsable manifest");
                        }
                    }
                }
                Ok(resp) => {
                    last_error = format!("{server}: HTTP {}", resp.status());
                }
                Err(e) => {
                    last_error = format!("{server}: {e}");
                    warn!(server, error = %e, "skill server unreachable, trying next");
                }
            }
        }

        Err(SkillsError::AllServersUnavailable(last_error))
    }

    /// Invokes `skill_id` with `args`, trying the next server only on a
    /// network-level failure. A server that actually responds with a
    /// non-2xx status is treated as the final answer, not a fallback
    /// trigger (§4.2).
    pub async fn invoke(&self, skill_id: &str, args: RunRequest) -> Result<RunResult, SkillsError> {
        let mut last_network_error = String::from("no skill servers configured");

        for server in &self.servers {
            let url = format!("{}/run/{}", server.trim_end_matches('/'), skill_id);
            let response = match self.http.post(&url).json(&args).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    last_network_error = format!("{server}: {e}");
                    warn!(server, skill_id, error = %e, "skill server unreachable, trying next");
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(SkillsError::InvocationFailed {
                    skill_id: skill_id.to_string(),
                    status: status.as_u16(),
                    body,
                });
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();

            let body_text = response.text().await?;
            if content_type.contains("application/json") {
                let value: serde_json::Value = serde_json::from_str(&body_text)?;
                return Ok(RunResult::Json(value));
            }
            return Ok(RunResult::Text(body_text));
        }

        Err(SkillsError::AllServersUnavailable(last_network_error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn capabilities_parses_the_manifest_from_the_first_server() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/capabilities"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "weather": {
                    "description": "checks the weather",
                    "run_info": {"parameters": {}}
                }
            })))
            .mount(&server)
            .await;

        let client = SkillRegistryClient::new(vec![server.uri()], 5);
        let descriptors = client.capabilities().await.unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].name, "weather");
    }

    #[tokio::test]
    async fn capabilities_falls_through_to_the_next_server_on_network_failure() {
        let second = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/capabilities"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "weather": {"description": "checks the weather", "run_info": {"parameters": {}}}
            })))
            .mount(&second)
            .await;

        let client = SkillRegistryClient::new(vec!["http://127.0.0.1:1".to_string(), second.uri()], 2);
        let descriptors = client.capabilities().await.unwrap();
        assert_eq!(descriptors.len(), 1);
    }

    #[tokio::test]
    async fn invoke_surfaces_a_non_2xx_response_without_trying_the_next_server() {
        let first = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/run/weather"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&first)
            .await;
        let second = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/run/weather"))
            .respond_with(ResponseTemplate::new(200).set_body_string("should not be reached"))
            .mount(&second)
            .await;

        let client = SkillRegistryClient::new(vec![first.uri(), second.uri()], 2);
        let err = client
            .invoke("weather", RunRequest::new())
            .await
            .unwrap_err();
        match err {
            SkillsError::InvocationFailed { status, body, .. } => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("expected InvocationFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invoke_returns_a_text_result_for_a_plain_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/run/weather"))
            .respond_with(ResponseTemplate::new(200).set_body_string("12C and cloudy"))
            .mount(&server)
            .await;

        let client = SkillRegistryClient::new(vec![server.uri()], 2);
        let result = client.invoke("weather", RunRequest::new()).await.unwrap();
        match result {
            RunResult::Text(s) => assert_eq!(s, "12C and cloudy"),
            other => panic!("expected Text, got {other:?}"),
        }
    }
}
