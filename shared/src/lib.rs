use serde::de;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Stream the controller writes scheduling requests to.
pub const REQUEST_STREAM: &str = "malleability_manager";

/// Stream decision responses are appended to.
pub const REPLY_STREAM: &str = "intelligent_controller";

/// Literal the workload manager reports when a job's command is unknown.
pub const NULL_COMMAND: &str = "(null)";

/// One queue entry as reported by `/queue/list`. The command of a pending
/// job travels in the Slurm comment field.
#[derive(Debug, Clone, Deserialize)]
pub struct PendingJob {
    #[serde(rename = "STATE")]
    pub state: String,
    #[serde(rename = "NODES")]
    nodes: NodeCount,
    #[serde(rename = "COMMENT")]
    pub comment: String,
}

// Slurm emits NODES as a decimal string; tolerate a bare number as well.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum NodeCount {
    Count(u64),
    Text(String),
}

impl PendingJob {
    /// Node count the job would be allocated if scheduled.
    pub fn nodes(&self) -> anyhow::Result<u64> {
        match &self.nodes {
            NodeCount::Count(count) => Ok(*count),
            NodeCount::Text(text) => text
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid NODES value {text:?} in queue entry")),
        }
    }
}

/// A job currently executing, as reported by `/job/list`. `size` is the
/// number of processes, nodes times processes per node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunningJob {
    pub jobid: String,
    pub command: String,
    pub size: u64,
}

/// A recorded historical run of a command: the job id telemetry models are
/// queried against, and the size (in processes) it ran at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    pub jobid: String,
    pub command: String,
    pub size: u64,
}

/// One point of a modeled metric series: a `[t, v]` wire pair where `v`
/// is a decimal string (a bare number is also accepted).
#[derive(Debug, Clone, PartialEq)]
pub struct ModelPoint {
    pub t: f64,
    pub value: f64,
}

impl<'de> Deserialize<'de> for ModelPoint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawValue {
            Number(f64),
            Text(String),
        }

        let (t, raw) = <(f64, RawValue)>::deserialize(deserializer)?;
        let value = match raw {
            RawValue::Number(value) => value,
            RawValue::Text(text) => text
                .trim()
                .parse()
                .map_err(|_| de::Error::custom(format!("model value {text:?} is not a number")))?,
        };
        Ok(ModelPoint { t, value })
    }
}

/// Outcome of one inbound request, rendered onto the reply stream as a
/// flat map of string fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    ModifyConfiguration { job_id: String, delta: i64 },
    RetainConfiguration { job_id: String },
    Error { message: String, job_id: Option<String> },
}

impl Response {
    pub fn modify(job_id: impl Into<String>, delta: i64) -> Self {
        Response::ModifyConfiguration {
            job_id: job_id.into(),
            delta,
        }
    }

    pub fn retain(job_id: impl Into<String>) -> Self {
        Response::RetainConfiguration {
            job_id: job_id.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
            job_id: None,
        }
    }

    pub fn error_for_job(message: impl Into<String>, job_id: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
            job_id: Some(job_id.into()),
        }
    }

    /// Field list appended verbatim to the reply stream.
    pub fn fields(&self) -> Vec<(String, String)> {
        match self {
            Response::ModifyConfiguration { job_id, delta } => vec![
                ("result".into(), "modify_configuration".into()),
                ("job_id".into(), job_id.clone()),
                ("delta".into(), delta.to_string()),
            ],
            Response::RetainConfiguration { job_id } => vec![
                ("result".into(), "retain_configuration".into()),
                ("job_id".into(), job_id.clone()),
            ],
            Response::Error { message, job_id } => {
                let mut fields = vec![
                    ("result".into(), "error".into()),
                    ("message".into(), message.clone()),
                ];
                if let Some(job_id) = job_id {
                    fields.push(("job_id".into(), job_id.clone()));
                }
                fields
            }
        }
    }
}

/// Nodes needed to host `size` processes at `procs_per_node` per node.
pub fn nodes_for(size: u64, procs_per_node: u64) -> u64 {
    size.div_ceil(procs_per_node)
}

/// Capability surface of a malleability strategy: one-shot initialization
/// from the init message, then a sequence of independent scheduling calls.
/// Alternate strategies plug in as further implementations.
#[allow(async_fn_in_trait)]
pub trait MalleabilityAlgorithm {
    type Error;

    /// Consume the init message. `None` means the algorithm is ready;
    /// `Some` carries the error reply to emit.
    fn initialize(&mut self, message: &HashMap<String, String>) -> Option<Response>;

    /// Decide whether the triggering job should keep or change its node
    /// count given the number of currently free nodes.
    async fn schedule(
        &mut self,
        job_id: &str,
        num_available_nodes: i64,
    ) -> Result<Response, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pending_job_accepts_string_and_numeric_nodes() {
        let from_text: PendingJob = serde_json::from_value(json!({
            "STATE": "PENDING",
            "NODES": "3",
            "COMMENT": "simulate",
            "PARTITION": "batch"
        }))
        .unwrap();
        assert_eq!(from_text.nodes().unwrap(), 3);
        assert_eq!(from_text.comment, "simulate");

        let from_number: PendingJob = serde_json::from_value(json!({
            "STATE": "PENDING",
            "NODES": 8,
            "COMMENT": "(null)"
        }))
        .unwrap();
        assert_eq!(from_number.nodes().unwrap(), 8);
        assert_eq!(from_number.comment, NULL_COMMAND);
    }

    #[test]
    fn pending_job_rejects_garbage_nodes() {
        let job: PendingJob = serde_json::from_value(json!({
            "STATE": "PENDING",
            "NODES": "N/A",
            "COMMENT": "simulate"
        }))
        .unwrap();
        assert!(job.nodes().is_err());
    }

    #[test]
    fn model_point_parses_wire_pairs() {
        let point: ModelPoint = serde_json::from_value(json!([16.0, "3.25"])).unwrap();
        assert_eq!(
            point,
            ModelPoint {
                t: 16.0,
                value: 3.25
            }
        );

        let bare: ModelPoint = serde_json::from_value(json!([4, 7.5])).unwrap();
        assert_eq!(bare.value, 7.5);

        assert!(serde_json::from_value::<ModelPoint>(json!([16.0, "abc"])).is_err());
    }

    #[test]
    fn response_fields_render_in_wire_order() {
        assert_eq!(
            Response::modify("j1", -2).fields(),
            vec![
                ("result".into(), "modify_configuration".into()),
                ("job_id".into(), "j1".into()),
                ("delta".into(), "-2".into()),
            ]
        );
        assert_eq!(
            Response::retain("j1").fields(),
            vec![
                ("result".into(), "retain_configuration".into()),
                ("job_id".into(), "j1".into()),
            ]
        );
        assert_eq!(
            Response::error_for_job("Job ID not found in running jobs", "j9").fields(),
            vec![
                ("result".into(), "error".into()),
                ("message".into(), "Job ID not found in running jobs".into()),
                ("job_id".into(), "j9".into()),
            ]
        );
    }

    #[test]
    fn node_count_rounds_up() {
        assert_eq!(nodes_for(16, 4), 4);
        assert_eq!(nodes_for(17, 4), 5);
        assert_eq!(nodes_for(1, 4), 1);
        assert_eq!(nodes_for(0, 4), 0);
    }
}
