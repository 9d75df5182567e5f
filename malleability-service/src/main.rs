use anyhow::Context;
use clap::Parser;
use malleability_service::proxy::MetricProxyClient;
use malleability_service::scheduler::IoIntensityAwareScheduler;
use malleability_service::session::Session;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Malleability decision service: answers grow/shrink/retain requests for
/// running HPC jobs from modeled I/O intensity.
#[derive(Debug, Parser)]
#[command(name = "malleability-service", version)]
struct Args {
    /// Redis host
    #[arg(long = "redis_host", default_value = "localhost")]
    redis_host: String,
    /// Redis port number
    #[arg(long = "redis_port", default_value_t = 6379)]
    redis_port: u16,
    /// Metric proxy host
    #[arg(long = "metric_proxy_host", default_value = "localhost")]
    metric_proxy_host: String,
    /// Metric proxy port number
    #[arg(long = "metric_proxy_port", default_value_t = 1337)]
    metric_proxy_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let redis_url = format!("redis://{}:{}/", args.redis_host, args.redis_port);
    let client = redis::Client::open(redis_url.as_str()).context("invalid Redis address")?;
    let connection = client
        .get_multiplexed_async_connection()
        .await
        .with_context(|| format!("connecting to Redis at {}:{}", args.redis_host, args.redis_port))?;

    let proxy_url = format!("http://{}:{}", args.metric_proxy_host, args.metric_proxy_port);
    info!(redis = %redis_url, metric_proxy = %proxy_url, "starting malleability session");

    let scheduler = IoIntensityAwareScheduler::new(MetricProxyClient::new(proxy_url));
    Session::new(connection, scheduler).run().await
}
