use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use flowforge_core::config::BackendConfig;
use flowforge_core::error::{FlowError, Result};
use flowforge_core::graph::MediaFamily;
use flowforge_core::traits::OperationHandler;
use flowforge_core::types::{NodeOutput, OperationRequest, RunId};

/// Client for a job-style generation service.
///
/// `POST {base_url}/generate/{family}` either answers with a finished output
/// or with `{jobId}`, in which case `GET {base_url}/jobs/{jobId}` is polled
/// every `poll_interval_ms` until the job settles or `max_wait_secs` passes.
pub struct HttpBackend {
    family: MediaFamily,
    http: Client,
    base_url: String,
    config: BackendConfig,
    name: String,
}

impl HttpBackend {
    pub fn new(family: MediaFamily, config: BackendConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .map(|url| url.trim_end_matches('/').to_string())
            .ok_or_else(|| {
                FlowError::Config(format!(
                    "backends.{} uses the http provider but has no base_url",
                    family.as_str()
                ))
            })?;
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| FlowError::Backend(e.to_string()))?;
        Ok(Self {
            family,
            http,
            base_url,
            config,
            name: format!("http-{}", family.as_str()),
        })
    }

    fn with_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {}", key)),
            None => builder,
        }
    }

    async fn submit(&self, body: &GenerateRequest<'_>) -> Result<Value> {
        let url = format!("{}/generate/{}", self.base_url, self.family.as_str());
        let response = self
            .with_auth(self.http.post(&url))
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| FlowError::Backend(e.to_string()))?;
        read_json(response).await
    }

    async fn fetch_job(&self, job_id: &str) -> Result<JobStatus> {
        let url = format!("{}/jobs/{}", self.base_url, job_id);
        let response = self
            .with_auth(self.http.get(&url))
            .send()
            .await
            .map_err(|e| FlowError::Backend(e.to_string()))?;
        let value = read_json(response).await?;
        serde_json::from_value(value)
            .map_err(|e| FlowError::Backend(format!("Malformed job status: {}", e)))
    }

    /// Poll a job until it settles. Bounded by `max_wait_secs` counted from
    /// `started`, which is taken before the job was submitted.
    async fn wait_for_job(
        &self,
        job_id: &str,
        request: &OperationRequest,
        started: Instant,
    ) -> Result<NodeOutput> {
        let deadline = started + Duration::from_secs(self.config.max_wait_secs);
        let interval = Duration::from_millis(self.config.poll_interval_ms.max(1));

        loop {
            let job = self.fetch_job(job_id).await?;
            if let Some(progress) = job.progress {
                request.progress.report(progress);
            }
            match job.state() {
                JobState::Succeeded => {
                    let output = job.output.ok_or_else(|| {
                        FlowError::Backend(format!("Job {} succeeded without output", job_id))
                    })?;
                    return Ok(NodeOutput::from_value(&output).with_metadata("jobId", job_id.into()));
                }
                JobState::Failed => {
                    let message = job.error.unwrap_or_else(|| format!("job {} failed", job_id));
                    return Err(FlowError::node(&request.node_id, message));
                }
                JobState::Pending => {}
            }

            let now = Instant::now();
            if now + interval > deadline {
                warn!(node_id = %request.node_id, job_id, "Backend job did not finish in time");
                return Err(FlowError::BackendTimeout {
                    job_id: job_id.to_string(),
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            debug!(node_id = %request.node_id, job_id, status = %job.status, "Job pending");
            tokio::time::sleep(interval).await;
        }
    }
}

async fn read_json(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        return Err(FlowError::Backend(format!("HTTP {}: {}", status, body)));
    }
    response
        .json()
        .await
        .map_err(|e| FlowError::Backend(format!("Invalid JSON response: {}", e)))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    run_id: &'a RunId,
    node_id: &'a str,
    inputs: &'a Map<String, Value>,
    params: Map<String, Value>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    status: String,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

enum JobState {
    Pending,
    Succeeded,
    Failed,
}

impl JobStatus {
    fn state(&self) -> JobState {
        match self.status.to_ascii_lowercase().as_str() {
            "succeeded" | "completed" | "done" => JobState::Succeeded,
            "failed" | "error" | "canceled" | "cancelled" => JobState::Failed,
            _ => JobState::Pending,
        }
    }
}

impl OperationHandler for HttpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn operate(&self, request: OperationRequest) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let mut params = request.params.to_map();
            if let Some(model) = &self.config.model {
                let unset = params.get("model").map_or(true, Value::is_null);
                if unset {
                    params.insert("model".into(), Value::String(model.clone()));
                }
            }
            let body = GenerateRequest {
                run_id: &request.run_id,
                node_id: &request.node_id,
                inputs: &request.inputs,
                params,
            };

            debug!(node_id = %request.node_id, family = self.family.as_str(), "Submitting generation");
            let started = Instant::now();
            let response = self.submit(&body).await?;
            match response.get("jobId").and_then(Value::as_str) {
                Some(job_id) => self.wait_for_job(job_id, &request, started).await,
                None => Ok(NodeOutput::from_value(&response)),
            }
        })
    }

    /// The poll loop carries its own deadline. The last poll may start just
    /// before it and take a full request timeout; one more is kept as slack.
    fn timeout_secs(&self) -> Option<u64> {
        Some(self.config.max_wait_secs + 2 * self.config.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;

    use super::*;
    use flowforge_core::event::{EventSink, ProgressEvent, ProgressReporter};
    use flowforge_core::graph::{NodeKind, NodeParams};

    #[derive(Clone, Default)]
    struct Fake {
        polls: Arc<AtomicUsize>,
    }

    async fn generate(
        Path(family): Path<String>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer sekret") {
            return (StatusCode::UNAUTHORIZED, Json(json!({"error": "no key"})));
        }
        let reply = match family.as_str() {
            "text" => json!({
                "type": "text",
                "data": format!("{} via {}", body["inputs"]["prompt"], body["params"]["model"]),
            }),
            "image" => json!({"jobId": "job-ok"}),
            "video" => json!({"jobId": "job-fail"}),
            _ => json!({"jobId": "job-stuck"}),
        };
        (StatusCode::OK, Json(reply))
    }

    async fn job(State(fake): State<Fake>, Path(id): Path<String>) -> Json<Value> {
        let polls = fake.polls.fetch_add(1, Ordering::SeqCst);
        Json(match id.as_str() {
            "job-ok" if polls == 0 => json!({"status": "running", "progress": 50.0}),
            "job-ok" => json!({
                "status": "succeeded",
                "progress": 100.0,
                "output": {"type": "image", "url": "https://cdn.test/fox.png"},
            }),
            "job-fail" => json!({"status": "failed", "error": "content policy"}),
            _ => json!({"status": "queued"}),
        })
    }

    async fn serve() -> String {
        let app = Router::new()
            .route("/generate/{family}", post(generate))
            .route("/jobs/{id}", get(job))
            .with_state(Fake::default());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn backend(family: MediaFamily, base_url: &str) -> HttpBackend {
        let config = BackendConfig {
            api_key: Some("sekret".into()),
            model: Some("house-model".into()),
            poll_interval_ms: 20,
            max_wait_secs: 1,
            ..BackendConfig::http(base_url)
        };
        HttpBackend::new(family, config).unwrap()
    }

    fn request(kind: NodeKind, progress: ProgressReporter) -> OperationRequest {
        let mut inputs = Map::new();
        inputs.insert("prompt".into(), json!("a fox"));
        OperationRequest {
            run_id: RunId::from_string("r1"),
            node_id: "n1".into(),
            kind,
            inputs,
            ports: vec!["prompt".into()],
            params: NodeParams::default_for(kind),
            progress,
        }
    }

    #[tokio::test]
    async fn test_immediate_output_with_model_default() {
        let url = serve().await;
        let out = backend(MediaFamily::Text, &url)
            .operate(request(NodeKind::GenerateText, ProgressReporter::noop("n1")))
            .await
            .unwrap();
        assert_eq!(out.output_type, "text");
        assert_eq!(out.data, Some(json!("\"a fox\" via \"house-model\"")));
    }

    #[tokio::test]
    async fn test_job_polled_to_success() {
        let url = serve().await;
        let (sink, mut rx) = EventSink::channel();
        let out = backend(MediaFamily::Image, &url)
            .operate(request(NodeKind::GenerateImage, sink.reporter("n1")))
            .await
            .unwrap();
        assert_eq!(out.url.as_deref(), Some("https://cdn.test/fox.png"));
        assert_eq!(out.metadata["jobId"], "job-ok");

        let mut progress = vec![];
        while let Ok(ProgressEvent::NodeProgress(p)) = rx.try_recv() {
            progress.push(p.progress);
        }
        assert_eq!(progress, vec![50.0, 100.0]);
    }

    #[tokio::test]
    async fn test_failed_job_fails_node() {
        let url = serve().await;
        let err = backend(MediaFamily::Video, &url)
            .operate(request(NodeKind::GenerateVideo, ProgressReporter::noop("n1")))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("content policy"));
    }

    #[tokio::test]
    async fn test_stuck_job_hits_deadline() {
        let url = serve().await;
        let err = backend(MediaFamily::Audio, &url)
            .operate(request(NodeKind::GenerateAudio, ProgressReporter::noop("n1")))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::BackendTimeout { .. }));
    }

    #[tokio::test]
    async fn test_rejected_key_is_backend_error() {
        let url = serve().await;
        let config = BackendConfig {
            api_key: Some("wrong".into()),
            ..BackendConfig::http(url.as_str())
        };
        let err = HttpBackend::new(MediaFamily::Text, config)
            .unwrap()
            .operate(request(NodeKind::GenerateText, ProgressReporter::noop("n1")))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("401"));
    }

    #[test]
    fn test_timeout_covers_poll_deadline() {
        let b = backend(MediaFamily::Image, "http://localhost:1/");
        assert_eq!(b.base_url, "http://localhost:1");
        assert_eq!(b.timeout_secs(), Some(121));
    }
}
