use anyhow::{bail, Result};
use reqwest::Client;
use serde::Deserialize;
use shared::{ModelPoint, PendingJob, Profile, RunningJob};
use std::collections::HashMap;

/// Thin typed client for the metric proxy's HTTP API. No retries, no
/// caching; transport and format failures are fatal to the request that
/// triggered them.
#[derive(Debug, Clone)]
pub struct MetricProxyClient {
    base_url: String,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct QueueReply {
    jobs: HashMap<String, PendingJob>,
}

// Model endpoints answer either `{"success": false, ...}` (no model) or
// the payload itself. The absence shape is tried first so a missing model
// never reaches value parsing.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ModelReply<T> {
    Status { success: bool },
    Series(Vec<T>),
}

impl<T> ModelReply<T> {
    fn into_series(self) -> Result<Option<Vec<T>>> {
        match self {
            ModelReply::Series(points) => Ok(Some(points)),
            ModelReply::Status { success: false } => Ok(None),
            ModelReply::Status { success: true } => {
                bail!("metric proxy reported success without a payload")
            }
        }
    }
}

impl MetricProxyClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: Client::new(),
        }
    }

    /// Queue entries still waiting to be scheduled, keyed by queue id.
    pub async fn pending_jobs(&self) -> Result<HashMap<String, PendingJob>> {
        let reply: QueueReply = self.get_json(&format!("{}/queue/list", self.base_url)).await?;
        Ok(reply
            .jobs
            .into_iter()
            .filter(|(_, job)| job.state == "PENDING")
            .collect())
    }

    /// Jobs currently executing, keyed by job id. Entries without any
    /// allocated processes are dropped.
    pub async fn running_jobs(&self) -> Result<HashMap<String, RunningJob>> {
        let jobs: Vec<RunningJob> = self.get_json(&format!("{}/job/list", self.base_url)).await?;
        Ok(jobs
            .into_iter()
            .filter(|job| job.size > 0)
            .map(|job| (job.jobid.clone(), job))
            .collect())
    }

    /// Historical profile catalog, in proxy order.
    pub async fn profiles(&self) -> Result<Vec<Profile>> {
        self.get_json(&format!("{}/profiles", self.base_url)).await
    }

    /// Single historical profile for `job_id`.
    pub async fn profile(&self, job_id: &str) -> Result<Profile> {
        self.get_json(&format!("{}/profiles/get?jobid={job_id}", self.base_url))
            .await
    }

    /// Per-metric model catalog for `job_id`, or `None` when the proxy has
    /// no models for it.
    pub async fn models(&self, job_id: &str) -> Result<Option<Vec<HashMap<String, String>>>> {
        let reply: ModelReply<HashMap<String, String>> = self
            .get_json(&format!("{}/model/get?jobid={job_id}", self.base_url))
            .await?;
        reply.into_series()
    }

    /// Modeled series for one metric over `[start, end)` stepped by
    /// `step`, or `None` when the proxy has no model for the metric.
    pub async fn model_for(
        &self,
        job_id: &str,
        metric: &str,
        start: f64,
        end: f64,
        step: f64,
    ) -> Result<Option<Vec<ModelPoint>>> {
        let metric = urlencoding::encode(metric);
        let url = format!(
            "{}/model/plot?jobid={job_id}&metric={metric}&start={start}&end={end}&step={step}",
            self.base_url
        );
        let reply: ModelReply<ModelPoint> = self.get_json(&url).await?;
        reply.into_series()
    }

    /// Modeled scalar at `size`: the one-step window `[size, size + 1)`.
    pub async fn model_at(&self, job_id: &str, metric: &str, size: f64) -> Result<Option<f64>> {
        let points = self.model_for(job_id, metric, size, size + 1.0, 1.0).await?;
        Ok(points.and_then(|points| points.first().map(|point| point.value)))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            bail!("metric proxy request failed: {} {url}", response.status());
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn pending_jobs_keeps_only_pending_states() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/queue/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobs": {
                    "101": {"STATE": "PENDING", "NODES": "2", "COMMENT": "simulate"},
                    "102": {"STATE": "RUNNING", "NODES": "4", "COMMENT": "simulate"},
                    "103": {"STATE": "PENDING", "NODES": 1, "COMMENT": "(null)"}
                }
            })))
            .mount(&server)
            .await;

        let client = MetricProxyClient::new(server.uri());
        let jobs = client.pending_jobs().await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.contains_key("101"));
        assert!(jobs.contains_key("103"));
    }

    #[tokio::test]
    async fn running_jobs_drops_empty_allocations() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/job/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"jobid": "j1", "command": "simulate", "size": 16},
                {"jobid": "j2", "command": "(null)", "size": 0}
            ])))
            .mount(&server)
            .await;

        let client = MetricProxyClient::new(server.uri());
        let jobs = client.running_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs["j1"].size, 16);
    }

    #[tokio::test]
    async fn model_for_encodes_metric_and_parses_series() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/model/plot"))
            .and(query_param("jobid", "p1"))
            .and(query_param(
                "metric",
                "proxy_network_receive_bytes_total{interface=\"ibs1\"}",
            ))
            .and(query_param("start", "16"))
            .and(query_param("end", "17"))
            .and(query_param("step", "1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([[16.0, "12.5"], [17.0, "13"]])),
            )
            .mount(&server)
            .await;

        let client = MetricProxyClient::new(server.uri());
        let points = client
            .model_for(
                "p1",
                "proxy_network_receive_bytes_total{interface=\"ibs1\"}",
                16.0,
                17.0,
                1.0,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].value, 12.5);
        assert_eq!(points[1].value, 13.0);
    }

    #[tokio::test]
    async fn absent_model_propagates_as_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/model/plot"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "reason": "no model for metric"
            })))
            .mount(&server)
            .await;

        let client = MetricProxyClient::new(server.uri());
        let points = client.model_for("p1", "walltime", 4.0, 5.0, 1.0).await.unwrap();
        assert!(points.is_none());

        let value = client.model_at("p1", "walltime", 4.0).await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn model_at_takes_the_first_point() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/model/plot"))
            .and(query_param("start", "32"))
            .and(query_param("end", "33"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([[32.0, "7.25"]])))
            .mount(&server)
            .await;

        let client = MetricProxyClient::new(server.uri());
        let value = client.model_at("p1", "walltime", 32.0).await.unwrap();
        assert_eq!(value, Some(7.25));
    }

    #[tokio::test]
    async fn model_catalog_and_single_profile() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/model/get"))
            .and(query_param("jobid", "p1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"metric": "walltime", "model": "linear"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/profiles/get"))
            .and(query_param("jobid", "p1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobid": "p1", "command": "simulate", "size": 32
            })))
            .mount(&server)
            .await;

        let client = MetricProxyClient::new(server.uri());
        let models = client.models("p1").await.unwrap().unwrap();
        assert_eq!(models[0]["metric"], "walltime");

        let profile = client.profile("p1").await.unwrap();
        assert_eq!(profile.size, 32);
        assert_eq!(profile.command, "simulate");
    }

    #[tokio::test]
    async fn http_failures_are_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/profiles"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = MetricProxyClient::new(server.uri());
        assert!(client.profiles().await.is_err());
    }
}
