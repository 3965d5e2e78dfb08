//! Backend Client (§4.D): typed, bearer-authenticated client for the
//! backend REST surface (§6). Generalizes the original's `MicsApiClient`
//! (thin `requests` wrapper, bearer auth, JSON sanitization for
//! NaN/Infinity) into a `reqwest::Client`-based client, following the
//! teacher's `reqwest` usage pattern (JSON body, bearer header).

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use orch_protocol::sanitize_json;

use crate::domain::{BackendPilot, Protocol, ProgressCache, RunCache, SubjectRun};
use crate::errors::BackendError;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct RunWithProgress {
    #[serde(flatten)]
    pub run: RunCache,
    #[serde(default)]
    pub progress: Option<ProgressCache>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct IncrementTrialResponse {
    pub should_graduate: bool,
    pub current_trial: i64,
    pub current_step: i64,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct AdvanceStepResponse {
    pub finished: bool,
    #[serde(default)]
    pub current_step: Option<i64>,
    #[serde(default)]
    pub graduation: Option<Value>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SessionDetail {
    #[serde(default)]
    pub runs: Vec<SubjectRun>,
}

#[derive(Clone)]
pub struct BackendClient {
    http: Client,
    base_url: String,
    token: String,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            token: token.into(),
        }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T, BackendError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(method = %method, url = %url, "backend request");

        let mut request = self
            .http
            .request(method, &url)
            .bearer_auth(&self.token);
        if let Some(body) = body {
            request = request.json(&sanitize_json(&body));
        }

        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(if status == StatusCode::NOT_FOUND {
                BackendError::NotFound
            } else {
                BackendError::Http { status: status.as_u16(), body }
            });
        }

        Ok(response.json::<T>().await?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, BackendError> {
        self.request(Method::GET, path, None).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, BackendError> {
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn get_run(&self, run_id: i64) -> Result<RunCache, BackendError> {
        self.get(&format!("/session-runs/{run_id}")).await
    }

    pub async fn get_run_with_progress(&self, run_id: i64) -> Result<RunWithProgress, BackendError> {
        self.get(&format!("/session-runs/{run_id}/with-progress")).await
    }

    pub async fn get_run_by_subject_key(&self, subject_key: &str) -> Result<RunCache, BackendError> {
        self.get(&format!("/session-runs/by-subject-key/{subject_key}")).await
    }

    pub async fn mark_run_running(&self, run_id: i64) -> Result<Value, BackendError> {
        self.post(&format!("/session-runs/{run_id}/mark-running"), serde_json::json!({})).await
    }

    pub async fn stop_session_run(&self, run_id: i64) -> Result<Value, BackendError> {
        self.post(&format!("/session-runs/{run_id}/stop"), serde_json::json!({})).await
    }

    pub async fn complete_session_run(&self, run_id: i64) -> Result<Value, BackendError> {
        self.post(&format!("/session-runs/{run_id}/complete"), serde_json::json!({})).await
    }

    pub async fn mark_run_error(
        &self,
        run_id: i64,
        error_type: &str,
        error_message: &str,
    ) -> Result<Value, BackendError> {
        self.post(
            &format!("/session-runs/{run_id}/error"),
            serde_json::json!({ "error_type": error_type, "error_message": error_message }),
        )
        .await
    }

    pub async fn increment_trial(&self, run_id: i64) -> Result<IncrementTrialResponse, BackendError> {
        self.post(&format!("/runs/{run_id}/progress/increment"), serde_json::json!({})).await
    }

    pub async fn advance_step(&self, run_id: i64) -> Result<AdvanceStepResponse, BackendError> {
        self.post(&format!("/runs/{run_id}/progress/advance_step"), serde_json::json!({})).await
    }

    pub async fn get_pilot(&self, pilot_id: i64) -> Result<BackendPilot, BackendError> {
        self.get(&format!("/pilots/{pilot_id}")).await
    }

    pub async fn create_or_update_pilot(
        &self,
        name: &str,
        ip: Option<&str>,
        prefs: Value,
    ) -> Result<BackendPilot, BackendError> {
        let mut payload = serde_json::json!({ "name": name, "prefs": prefs });
        if let Some(ip) = ip {
            payload["ip"] = Value::String(ip.to_owned());
        }
        self.post("/pilots", payload).await
    }

    pub async fn upsert_pilot_tasks(&self, pilot_id: i64, tasks: Vec<Value>) -> Result<Value, BackendError> {
        self.post(&format!("/pilots/{pilot_id}/tasks"), serde_json::json!({ "tasks": tasks })).await
    }

    pub async fn get_protocol(&self, protocol_id: i64) -> Result<Protocol, BackendError> {
        self.get(&format!("/protocols/{protocol_id}")).await
    }

    pub async fn get_session_detail(&self, session_id: i64) -> Result<SessionDetail, BackendError> {
        self.get(&format!("/sessions/{session_id}")).await
    }

    pub async fn get_subject_runs_for_session(&self, session_id: i64) -> Result<Vec<SubjectRun>, BackendError> {
        Ok(self.get_session_detail(session_id).await?.runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{bearer_token, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn get_run_sends_bearer_auth_and_parses_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/session-runs/7"))
            .and(bearer_token("test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 7, "session_id": 3, "pilot_id": 2, "subject_key": "bp_s3_r7", "status": "pending"
            })))
            .mount(&server)
            .await;

        let client = BackendClient::new(server.uri(), "test-token");
        let run = client.get_run(7).await.unwrap();
        assert_eq!(run.id, 7);
        assert_eq!(run.subject_key, "bp_s3_r7");
    }

    #[tokio::test]
    async fn not_found_status_maps_to_not_found_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/session-runs/404"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = BackendClient::new(server.uri(), "test-token");
        let err = client.get_run(404).await.unwrap_err();
        assert!(matches!(err, BackendError::NotFound));
    }

    #[tokio::test]
    async fn server_error_status_maps_to_http_error_with_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session-runs/9/mark-running"))
            .respond_with(ResponseTemplate::new(500).set_body_string("db unavailable"))
            .mount(&server)
            .await;

        let client = BackendClient::new(server.uri(), "test-token");
        let err = client.mark_run_running(9).await.unwrap_err();
        match err {
            BackendError::Http { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "db unavailable");
            }
            other => panic!("expected Http error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn increment_trial_parses_graduation_decision() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/runs/7/progress/increment"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "should_graduate": true, "current_trial": 5, "current_step": 1
            })))
            .mount(&server)
            .await;

        let client = BackendClient::new(server.uri(), "test-token");
        let resp = client.increment_trial(7).await.unwrap();
        assert!(resp.should_graduate);
        assert_eq!(resp.current_trial, 5);
    }
}
