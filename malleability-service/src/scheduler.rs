//! The I/O-intensity-aware strategy: account the live workload, then pick
//! the candidate node count that best balances the running system against
//! the workload as a whole.

use crate::intensity;
use crate::proxy::MetricProxyClient;
use anyhow::{Context, Result};
use shared::{
    nodes_for, MalleabilityAlgorithm, PendingJob, Profile, Response, RunningJob, NULL_COMMAND,
};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::debug;

/// Session parameters, frozen at init.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionParams {
    pub procs_per_node: u64,
    pub min_required_profiles: usize,
    pub efficiency_threshold: f64,
}

/// Workload-wide intensity figures for the current scheduling tick.
/// Recomputed from scratch on every request.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IntensityFigures {
    /// Summed intensity of pending and running jobs.
    pub workload_bw: f64,
    /// Summed intensity of running jobs only.
    pub system_bw: f64,
    /// `workload_bw` averaged over the pending-job count.
    pub workload_io_intensity: f64,
    /// `system_bw` averaged over the running-job count.
    pub system_io_intensity: f64,
}

pub struct IoIntensityAwareScheduler {
    proxy: MetricProxyClient,
    params: Option<SessionParams>,
    figures: IntensityFigures,
}

impl IoIntensityAwareScheduler {
    pub fn new(proxy: MetricProxyClient) -> Self {
        Self {
            proxy,
            params: None,
            figures: IntensityFigures::default(),
        }
    }

    /// Figures computed by the most recent scheduling request.
    pub fn figures(&self) -> &IntensityFigures {
        &self.figures
    }

    /// Sum per-job intensities into the session figures and locate the
    /// triggering job among the running ones.
    async fn update_io_intensities(
        &mut self,
        params: &SessionParams,
        pending_jobs: &HashMap<String, PendingJob>,
        running_jobs: &HashMap<String, RunningJob>,
        triggering_job_id: &str,
        profiles: &[Profile],
    ) -> Result<Option<RunningJob>> {
        self.figures.workload_bw = 0.0;
        self.figures.system_bw = 0.0;

        for (queue_id, job) in pending_jobs {
            // The command of a queued job travels in the Slurm comment.
            let command = &job.comment;
            if command == NULL_COMMAND {
                continue;
            }
            let Some(profile) = profiles.iter().find(|profile| &profile.command == command)
            else {
                continue;
            };
            let size = job.nodes()? * params.procs_per_node;
            match intensity::io_intensity_at(&self.proxy, &profile.jobid, size).await? {
                Some(value) => self.figures.workload_bw += value,
                None => debug!(job = %queue_id, "no modeled telemetry for pending job, skipping"),
            }
        }

        let mut located_job = None;
        for (job_id, job) in running_jobs {
            if job_id == triggering_job_id {
                located_job = Some(job.clone());
            }
            if job.command == NULL_COMMAND {
                continue;
            }
            let Some(profile) = profiles.iter().find(|profile| profile.command == job.command)
            else {
                continue;
            };
            match intensity::io_intensity_at(&self.proxy, &profile.jobid, job.size).await? {
                Some(value) => {
                    self.figures.workload_bw += value;
                    self.figures.system_bw += value;
                }
                None => debug!(job = %job_id, "no modeled telemetry for running job, skipping"),
            }
        }

        self.figures.workload_io_intensity = if pending_jobs.is_empty() {
            0.0
        } else {
            self.figures.workload_bw / pending_jobs.len() as f64
        };
        self.figures.system_io_intensity = if running_jobs.is_empty() {
            0.0
        } else {
            self.figures.system_bw / running_jobs.len() as f64
        };

        Ok(located_job)
    }

    /// Enumerate the historically observed node counts for the job's
    /// command and pick the one that best balances the system.
    async fn best_configuration(
        &self,
        params: &SessionParams,
        job: &RunningJob,
        profiles: &[Profile],
        num_available_nodes: i64,
        job_count: usize,
    ) -> Result<Response> {
        let num_assigned_nodes = nodes_for(job.size, params.procs_per_node);

        let matching: Vec<&Profile> = profiles
            .iter()
            .filter(|profile| profile.command == job.command)
            .collect();
        if matching.len() < params.min_required_profiles {
            debug!(
                job = %job.jobid,
                profiles = matching.len(),
                "not enough historical profiles to reshape"
            );
            return Ok(Response::retain(&job.jobid));
        }

        let previous_configurations: Vec<u64> = matching
            .iter()
            .map(|profile| nodes_for(profile.size, params.procs_per_node))
            .collect();
        let (Some(&min_nodes), Some(&max_nodes)) = (
            previous_configurations.iter().min(),
            previous_configurations.iter().max(),
        ) else {
            return Ok(Response::retain(&job.jobid));
        };
        let min_size = min_nodes * params.procs_per_node;
        let max_size = max_nodes * params.procs_per_node;

        let query_id = &matching[0].jobid;
        let io_intensities = intensity::io_intensities(
            &self.proxy,
            query_id,
            min_size as f64,
            (max_size + 1) as f64,
            params.procs_per_node as f64,
        )
        .await?
        .with_context(|| format!("no modeled telemetry for profile job {query_id}"))?;

        // Candidate node counts pair positionally with the intensity
        // vector; the job's current count and anything past the free-node
        // budget are dropped (shrinks always pass the budget filter).
        let configurations = (min_size..=max_size)
            .step_by(params.procs_per_node as usize)
            .map(|size| size / params.procs_per_node);
        let candidates: Vec<(u64, f64)> = configurations
            .zip(io_intensities)
            .filter(|&(configuration, _)| {
                configuration as i64 - num_assigned_nodes as i64 <= num_available_nodes
                    && configuration != num_assigned_nodes
            })
            .collect();
        if candidates.is_empty() {
            return Ok(Response::retain(&job.jobid));
        }

        let job_io_intensity = intensity::io_intensity_at(&self.proxy, query_id, job.size)
            .await?
            .with_context(|| {
                format!(
                    "no modeled telemetry for profile job {query_id} at size {}",
                    job.size
                )
            })?;

        let scored = score_candidates(
            &self.figures,
            &candidates,
            num_assigned_nodes,
            job_io_intensity,
            job_count,
        );
        let Some(&(delta, nodes_delta)) = scored.first() else {
            return Ok(Response::retain(&job.jobid));
        };

        // Expansions must buy enough balance relative to the current
        // system intensity; shrinks never fire.
        if nodes_delta > 0 && delta / self.figures.system_io_intensity > params.efficiency_threshold
        {
            Ok(Response::modify(&job.jobid, nodes_delta))
        } else {
            Ok(Response::retain(&job.jobid))
        }
    }
}

/// Score each candidate by how far the hypothetical running-system
/// intensity would land from the workload-wide intensity, ascending.
/// Ties keep the candidate order.
pub fn score_candidates(
    figures: &IntensityFigures,
    candidates: &[(u64, f64)],
    num_assigned_nodes: u64,
    job_io_intensity: f64,
    job_count: usize,
) -> Vec<(f64, i64)> {
    let mut deltas: Vec<(f64, i64)> = candidates
        .iter()
        .map(|&(configuration, io_intensity)| {
            let nodes_delta = configuration as i64 - num_assigned_nodes as i64;
            let new_system_io_intensity =
                (figures.system_bw - job_io_intensity + io_intensity) / job_count as f64;
            let delta = (figures.workload_io_intensity - new_system_io_intensity).abs();
            (delta, nodes_delta)
        })
        .collect();
    deltas.sort_by(|a, b| a.0.total_cmp(&b.0));
    deltas
}

impl MalleabilityAlgorithm for IoIntensityAwareScheduler {
    type Error = anyhow::Error;

    fn initialize(&mut self, message: &HashMap<String, String>) -> Option<Response> {
        let command = match message.get("command") {
            Some(command) => command,
            None => {
                return Some(Response::error(
                    r#""command" expected in message but is missing"#,
                ))
            }
        };
        if command != "init" {
            return Some(Response::error(format!(
                r#"Expected "init" as initialization command but got {command}"#
            )));
        }

        let procs_per_node: u64 = match require_field(message, "procs_per_node", "int") {
            Ok(value) => value,
            Err(response) => return Some(response),
        };
        if procs_per_node == 0 {
            return Some(Response::error(
                r#""procs_per_node" must be a positive integer"#,
            ));
        }
        let min_required_profiles = match require_field(message, "min_required_profiles", "int") {
            Ok(value) => value,
            Err(response) => return Some(response),
        };
        let efficiency_threshold = match require_field(message, "efficiency_threshold", "float") {
            Ok(value) => value,
            Err(response) => return Some(response),
        };

        self.params = Some(SessionParams {
            procs_per_node,
            min_required_profiles,
            efficiency_threshold,
        });
        None
    }

    async fn schedule(&mut self, job_id: &str, num_available_nodes: i64) -> Result<Response> {
        let Some(params) = self.params else {
            return Ok(Response::error(
                "I/O-intensity-aware scheduler has not been initialized",
            ));
        };
        if num_available_nodes < 1 {
            return Ok(Response::error(
                "Number of available nodes can not be less than 1",
            ));
        }

        let pending_jobs = self.proxy.pending_jobs().await?;
        let running_jobs = self.proxy.running_jobs().await?;
        if running_jobs.is_empty() {
            return Ok(Response::error("List of running jobs is empty"));
        }
        let profiles = self.proxy.profiles().await?;

        let located_job = self
            .update_io_intensities(&params, &pending_jobs, &running_jobs, job_id, &profiles)
            .await?;
        let Some(job) = located_job else {
            return Ok(Response::error_for_job(
                "Job ID not found in running jobs",
                job_id,
            ));
        };

        self.best_configuration(&params, &job, &profiles, num_available_nodes, running_jobs.len())
            .await
    }
}

fn require_field<T: FromStr>(
    message: &HashMap<String, String>,
    name: &str,
    expected: &str,
) -> Result<T, Response> {
    let Some(raw) = message.get(name) else {
        return Err(Response::error(format!(
            r#""{name}" expected in message but is missing"#
        )));
    };
    raw.trim().parse().map_err(|_| {
        Response::error(format!(
            r#""{name}" must be of type {expected} but got "{raw}""#
        ))
    })
}
