//! I/O intensity derived from four correlated modeled metrics: time spent
//! in MPI waits, walltime, and bytes moved over the interconnect in each
//! direction.

use crate::proxy::MetricProxyClient;
use anyhow::Result;
use shared::ModelPoint;

/// Metric names the intensity model is built from, queried in this order.
pub const IO_TIME_METRIC: &str = "mpi___time___mpi_wtime";
pub const TOTAL_TIME_METRIC: &str = "walltime";
pub const READ_BYTES_METRIC: &str = r#"proxy_network_receive_bytes_total{interface="ibs1"}"#;
pub const WRITTEN_BYTES_METRIC: &str = r#"proxy_network_transmit_bytes_total{interface="ibs1"}"#;

/// I/O intensities for `job_id` over `[start, end)` stepped by `step`,
/// one scalar per step. `None` when any of the four underlying models is
/// absent.
pub async fn io_intensities(
    proxy: &MetricProxyClient,
    job_id: &str,
    start: f64,
    end: f64,
    step: f64,
) -> Result<Option<Vec<f64>>> {
    let Some(io_times) = proxy.model_for(job_id, IO_TIME_METRIC, start, end, step).await? else {
        return Ok(None);
    };
    let Some(total_times) = proxy
        .model_for(job_id, TOTAL_TIME_METRIC, start, end, step)
        .await?
    else {
        return Ok(None);
    };
    let Some(read_bytes) = proxy
        .model_for(job_id, READ_BYTES_METRIC, start, end, step)
        .await?
    else {
        return Ok(None);
    };
    let Some(written_bytes) = proxy
        .model_for(job_id, WRITTEN_BYTES_METRIC, start, end, step)
        .await?
    else {
        return Ok(None);
    };

    Ok(Some(combine(
        &values(&io_times),
        &values(&total_times),
        &values(&read_bytes),
        &values(&written_bytes),
    )))
}

/// Single intensity at `size`: the first element of the one-step window
/// `[size, size + 1)`. An absent or empty model propagates as `None`.
pub async fn io_intensity_at(
    proxy: &MetricProxyClient,
    job_id: &str,
    size: u64,
) -> Result<Option<f64>> {
    let intensities = io_intensities(proxy, job_id, size as f64, (size + 1) as f64, 1.0).await?;
    Ok(intensities.and_then(|intensities| intensities.first().copied()))
}

/// Element-wise intensity: `(io_time / total_time) * ((rx + tx) / io_time)`.
/// Series are zipped to the shortest input; no smoothing or outlier
/// rejection is applied, and IEEE-754 semantics govern zero denominators.
pub fn combine(
    io_times: &[f64],
    total_times: &[f64],
    read_bytes: &[f64],
    written_bytes: &[f64],
) -> Vec<f64> {
    io_times
        .iter()
        .zip(total_times)
        .zip(read_bytes)
        .zip(written_bytes)
        .map(|(((&io_time, &total_time), &rx), &tx)| {
            let fraction_io = io_time / total_time;
            let bandwidth = (rx + tx) / io_time;
            fraction_io * bandwidth
        })
        .collect()
}

fn values(points: &[ModelPoint]) -> Vec<f64> {
    points.iter().map(|point| point.value).collect()
}
