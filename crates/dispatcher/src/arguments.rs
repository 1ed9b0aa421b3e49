use {
    std::{net::SocketAddr, num::NonZeroUsize, time::Duration},
    url::Url,
};

const DEFAULT_PROMPT_TEMPLATE: &str = "Determine the single exact catalog classification code for \
     the product described below. Reply with the code alone, in the format \
     XX.XX.XX.XXX-XXXXXXXX, or with \"code not found\" if no code matches with high \
     confidence.\n\n{text}";

#[derive(clap::Parser)]
pub struct Arguments {
    /// Tracing filter directives.
    #[clap(long, env, default_value = "info")]
    pub log_filter: String,

    /// Address the inbound HTTP API binds to.
    #[clap(long, env, default_value = "0.0.0.0:8080")]
    pub bind_address: SocketAddr,

    #[clap(long, env, default_value = "0.0.0.0:9586")]
    pub metrics_address: SocketAddr,

    /// Key inbound callers must present in the `X-API-Key` header.
    #[clap(long, env)]
    pub api_key: String,

    /// Url of the Redis instance backing the task and outbox stores.
    #[clap(long, env, default_value = "redis://localhost:6379/0")]
    pub store_url: Url,

    /// Base url of the remote batch API.
    #[clap(long, env, default_value = "https://api.anthropic.com")]
    pub remote_api_base: Url,

    /// Key for the remote batch API.
    #[clap(long, env)]
    pub remote_api_key: String,

    /// Model all classification requests are sent to.
    #[clap(long, env, default_value = "claude-3-7-sonnet-20250219")]
    pub model: String,

    /// Completion budget per classification request.
    #[clap(long, env, default_value = "32768")]
    pub max_tokens: u32,

    /// Prompt template for text submissions; `{text}` is replaced with the
    /// submitted text.
    #[clap(long, env, default_value = DEFAULT_PROMPT_TEMPLATE)]
    pub prompt_template: String,

    /// Submit attempts per task before it fails for good.
    #[clap(long, env, default_value = "3")]
    pub max_attempts: u32,

    /// Pause between dispatch and relay cycles.
    #[clap(long, env, default_value = "5s", value_parser = humantime::parse_duration)]
    pub poll_interval: Duration,

    /// Pause between polls of in-flight batches.
    #[clap(long, env, default_value = "60s", value_parser = humantime::parse_duration)]
    pub batch_check_interval: Duration,

    /// Timeout of a single webhook delivery, before per-attempt jitter.
    #[clap(long, env, default_value = "300s", value_parser = humantime::parse_duration)]
    pub request_timeout: Duration,

    /// Callback target for notifications that do not carry their own.
    #[clap(
        long,
        env,
        default_value = "http://localhost:8000/api/v1/callbacks/processing"
    )]
    pub callback_url: Url,

    /// Secret webhook bodies are HMAC-signed with.
    #[clap(long, env)]
    pub callback_secret: String,

    /// How long records of non-terminal tasks live.
    #[clap(long, env, default_value = "7days", value_parser = humantime::parse_duration)]
    pub task_pending_ttl: Duration,

    /// How long records of completed tasks live.
    #[clap(long, env, default_value = "3days", value_parser = humantime::parse_duration)]
    pub task_completed_ttl: Duration,

    /// How long records of failed tasks live.
    #[clap(long, env, default_value = "14days", value_parser = humantime::parse_duration)]
    pub task_failed_ttl: Duration,

    /// Pending tasks claimed per dispatch cycle.
    #[clap(long, env, default_value = "10")]
    pub dispatch_batch_size: usize,

    /// Concurrent remote submissions.
    #[clap(long, env, default_value = "10")]
    pub dispatch_concurrency: NonZeroUsize,

    /// Due notifications claimed per relay cycle.
    #[clap(long, env, default_value = "10")]
    pub relay_batch_size: usize,

    /// Concurrent webhook deliveries.
    #[clap(long, env, default_value = "10")]
    pub relay_concurrency: NonZeroUsize,
}

impl std::fmt::Display for Arguments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "log_filter: {}", self.log_filter)?;
        writeln!(f, "bind_address: {}", self.bind_address)?;
        writeln!(f, "metrics_address: {}", self.metrics_address)?;
        writeln!(f, "api_key: SECRET")?;
        writeln!(f, "store_url: SECRET")?;
        writeln!(f, "remote_api_base: {}", self.remote_api_base)?;
        writeln!(f, "remote_api_key: SECRET")?;
        writeln!(f, "model: {}", self.model)?;
        writeln!(f, "max_tokens: {}", self.max_tokens)?;
        writeln!(f, "prompt_template: {:?}", self.prompt_template)?;
        writeln!(f, "max_attempts: {}", self.max_attempts)?;
        writeln!(f, "poll_interval: {:?}", self.poll_interval)?;
        writeln!(f, "batch_check_interval: {:?}", self.batch_check_interval)?;
        writeln!(f, "request_timeout: {:?}", self.request_timeout)?;
        writeln!(f, "callback_url: {}", self.callback_url)?;
        writeln!(f, "callback_secret: SECRET")?;
        writeln!(f, "task_pending_ttl: {:?}", self.task_pending_ttl)?;
        writeln!(f, "task_completed_ttl: {:?}", self.task_completed_ttl)?;
        writeln!(f, "task_failed_ttl: {:?}", self.task_failed_ttl)?;
        writeln!(f, "dispatch_batch_size: {}", self.dispatch_batch_size)?;
        writeln!(f, "dispatch_concurrency: {}", self.dispatch_concurrency)?;
        writeln!(f, "relay_batch_size: {}", self.relay_batch_size)?;
        writeln!(f, "relay_concurrency: {}", self.relay_concurrency)?;
        Ok(())
    }
}
