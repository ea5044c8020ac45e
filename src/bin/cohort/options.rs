use nakadi_cohort::domain::{HandlerErrorPolicy, OffsetStoreKind};
use nakadi_cohort::library::codec::WireEnum;
use nakadi_cohort::library::helpers::{parse_millis, parse_seconds};
use std::time::Duration;
use structopt::StructOpt;

/// Output format of log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Compact,
    Json,
}

impl WireEnum for LogFormat {
    const VARIANTS: &'static [(&'static str, Self)] = &[
        ("text", LogFormat::Text),
        ("compact", LogFormat::Compact),
        ("json", LogFormat::Json),
    ];
}

nakadi_cohort::wire_enum!(LogFormat);

#[derive(Debug, StructOpt)]
#[structopt(
    about = "Consumes Nakadi event types together with every other process of the same consumer group.",
    version = env!("CARGO_PKG_VERSION")
)]
pub struct MainOptions {
    /// Log level, scopable to different modules
    ///
    /// Levels: trace, debug, info, warn, error
    #[structopt(
        short,
        long,
        default_value = "info,hyper=warn,redis=warn",
        env = "RUST_LOG",
        value_name = "level"
    )]
    pub log: String,

    /// Format of log lines: text, compact or json
    #[structopt(long, env, default_value = "text", value_name = "format")]
    pub log_format: LogFormat,

    /// Enable status reporting server which can be used as a readiness probe
    #[structopt(long, env, value_name = "port")]
    pub status_server: Option<u16>,

    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub redis: RedisOptions,

    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub nakadi: NakadiOptions,

    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub consumer: ConsumerOptions,
}

/// Coordination backend
#[derive(Debug, StructOpt)]
pub struct RedisOptions {
    /// Redis database server URL
    #[structopt(long = "redis", env = "REDIS", default_value = "redis://redis/", value_name = "url")]
    pub url: String,

    /// Prefix of every key and channel used in Redis
    #[structopt(long, env, default_value = "cohort")]
    pub redis_namespace: String,
}

/// Broker endpoint
#[derive(Debug, StructOpt)]
pub struct NakadiOptions {
    /// Base URL of the Nakadi API
    #[structopt(long = "nakadi-url", env = "NAKADI_URL", value_name = "url")]
    pub url: String,

    /// Bearer token sent with every request
    #[structopt(long = "nakadi-token", env = "NAKADI_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Time (in seconds) the broker may take to respond to a request
    #[structopt(long, env, default_value = "30", parse(try_from_str = parse_seconds))]
    pub request_timeout: Duration,
}

/// Consumer group settings
#[derive(Debug, StructOpt)]
pub struct ConsumerOptions {
    /// Name of the consumer group shared by every cooperating process
    #[structopt(long, env)]
    pub consumer_name: String,

    /// Event types to consume, separated by commas
    #[structopt(long, env, required = true, use_delimiter = true)]
    pub event_types: Vec<String>,

    /// Fixed member identifier, generated from hostname and process id if omitted
    #[structopt(long, env)]
    pub member_id: Option<String>,

    /// Reaction to batches that can't be processed: skip, retry or fail
    #[structopt(long, env, default_value = "fail")]
    pub handler_error_policy: HandlerErrorPolicy,

    /// Backend for committed cursors: coordination_store or broker
    #[structopt(long, env, default_value = "coordination_store")]
    pub offset_store: OffsetStoreKind,

    /// Time (in seconds) between two partition discovery runs
    #[structopt(long, env, default_value = "30", parse(try_from_str = parse_seconds))]
    pub discovery_interval: Duration,

    /// Time (in seconds) after which the session of an unresponsive member ends
    #[structopt(long, env, default_value = "10", parse(try_from_str = parse_seconds))]
    pub session_timeout: Duration,

    /// Time (in seconds) individual coordination operations may take
    #[structopt(long, env, default_value = "5", parse(try_from_str = parse_seconds))]
    pub operation_timeout: Duration,

    /// Grace period (in milliseconds) for workers to finish their current batch on shutdown
    #[structopt(long, env, default_value = "1000", parse(try_from_str = parse_millis))]
    pub drain_timeout: Duration,

    /// Number of batches that may be processed concurrently across all partitions
    #[structopt(long, env, default_value = "16")]
    pub max_parallel_handlers: usize,
}
