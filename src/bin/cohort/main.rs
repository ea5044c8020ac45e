use anyhow::{Context, Result};
use nakadi_cohort::consumer::{broker::HyperBrokerClient, handler_fn, BatchContext, Consumer, ConsumerConfig, ConsumerModule};
use nakadi_cohort::harness::ModuleRunner;
use nakadi_cohort::library::coordination::redis::{RedisCoordinationStore, RedisStoreOptions};
use options::{LogFormat, MainOptions};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use structopt::StructOpt;
use tracing::info;

mod options;

#[tokio::main]
async fn main() -> Result<()> {
    let options = MainOptions::from_args();
    let runner = init(&options).shutdown_timeout(options.consumer.drain_timeout + Duration::from_secs(30));

    let consumer = build_consumer(options).await?;
    let clean = runner.run(ConsumerModule::new(consumer)).await;

    if clean {
        Ok(())
    } else {
        anyhow::bail!("consumer terminated abnormally")
    }
}

fn init(options: &MainOptions) -> ModuleRunner {
    let formatter = tracing_subscriber::fmt().with_env_filter(options.log.as_str());

    match options.log_format {
        LogFormat::Text => formatter.init(),
        LogFormat::Compact => formatter.compact().init(),
        LogFormat::Json => formatter.json().init(),
    };

    info!("nakadi-cohort {}", env!("CARGO_PKG_VERSION"));

    match options.status_server {
        Some(port) => ModuleRunner::new_with_status_server(port),
        None => ModuleRunner::default(),
    }
}

async fn build_consumer(options: MainOptions) -> Result<Consumer> {
    let settings = options.consumer;

    let store = RedisCoordinationStore::connect(
        &options.redis.url,
        RedisStoreOptions {
            namespace: options.redis.redis_namespace,
            session_timeout: settings.session_timeout,
            operation_timeout: settings.operation_timeout,
        },
    )
    .await
    .context("unable to connect to the coordination store")?;

    let broker = HyperBrokerClient::new(options.nakadi.url, options.nakadi.token, options.nakadi.request_timeout);

    let mut builder = ConsumerConfig::builder(settings.consumer_name)
        .discovery_interval(settings.discovery_interval)
        .session_timeout(settings.session_timeout)
        .operation_timeout(settings.operation_timeout)
        .drain_timeout(settings.drain_timeout)
        .handler_error_policy(settings.handler_error_policy)
        .offset_store(settings.offset_store)
        .max_parallel_handlers(settings.max_parallel_handlers);

    for event_type in settings.event_types.iter().map(|e| e.trim()).filter(|e| !e.is_empty()) {
        builder = builder.handler(event_type, handler_fn(log_batch));
    }

    if let Some(member_id) = settings.member_id {
        builder = builder.member_id(member_id.as_str());
    }

    let config = builder.build().context("invalid consumer configuration")?;
    let consumer = Consumer::new(config, Arc::new(store), Arc::new(broker))?;

    Ok(consumer)
}

async fn log_batch(context: BatchContext, events: Vec<Value>) -> nakadi_cohort::library::EmptyResult {
    info!(
        event_type = %context.event_type,
        partition = %context.partition,
        offset = %context.cursor.offset,
        events = events.len(),
        "Batch received"
    );

    Ok(())
}
