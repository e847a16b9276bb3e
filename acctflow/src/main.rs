//! acctflow - account-event pipeline
//!
//! `produce` publishes generated account events at an operator-controlled rate,
//! `consume` delivers them to the downstream account service with retries and
//! dead-lettering, `create-topics` provisions the topics both sides use.

use acctflow::args::{Args, Command, ConsumeArgs, ProduceArgs, TopicArgs};
use acctflow::bus::BusProducer;
use acctflow::consumer::{LaneConfig, PartitionLane};
use acctflow::control;
use acctflow::dead_letter::DeadLetterSink;
use acctflow::downstream::HttpAccountService;
use acctflow::kafka_bus::{KafkaBus, KafkaBusConfig};
use acctflow::kafka_client::KafkaClient;
use acctflow::load::LoadProducer;
use acctflow::processor::{MessageProcessor, ProcessorParts};
use acctflow::reporter::{join_reporter, StatsReporter};
use acctflow::retry::RetryCoordinator;
use acctflow::store::{InMemoryStore, JournalStore, TransactionStore};
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Initialize tracing subscriber for structured logging
fn setup_logging(quiet: bool) {
    let default_level = if quiet { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::filter::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(default_level)),
        )
        .init();
}

/// Cancels `shutdown` on Ctrl-C
fn cancel_on_ctrl_c(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!("Failed to listen for Ctrl-C, shutting down: {}", e),
        }
        shutdown.cancel();
    });
}

async fn connect(broker: &str) -> Result<Arc<KafkaClient>> {
    let client = KafkaClient::connect(broker)
        .await
        .map_err(|e| anyhow!("Failed to connect to {}: {}", broker, e))?;
    Ok(Arc::new(client))
}

async fn run_produce(args: &Args, produce: &ProduceArgs) -> Result<()> {
    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    let client = connect(&args.broker).await?;
    let mut bus_config = KafkaBusConfig {
        acks: produce.acks,
        linger: Duration::from_millis(produce.linger_ms),
        batch_bytes: produce.batch_bytes,
        ..KafkaBusConfig::default()
    };
    bus_config
        .topic_partitions
        .insert(args.topic.clone(), args.partitions);
    let bus = Arc::new(KafkaBus::start(client, bus_config)?);

    let load = Arc::new(LoadProducer::new(bus.clone(), args.topic.clone(), produce.rate)?);
    info!(
        "Producer ready: topic {} with {} partitions, rate {} msg/s",
        args.topic,
        args.partitions,
        load.rate()
    );
    if produce.autostart {
        load.start().await;
    }

    let reporter_load = load.clone();
    let summary_load = load.clone();
    let reporter = StatsReporter::new(
        "produced",
        Duration::from_secs(produce.report_interval_secs.max(1)),
        move || reporter_load.stats().messages_successful,
        move || {
            let stats = summary_load.stats();
            format!(
                "sent={} successful={} failed={} running={}",
                stats.messages_sent,
                stats.messages_successful,
                stats.messages_failed,
                stats.running
            )
        },
    );
    let reporter_task = reporter.spawn(shutdown.clone());

    let served = control::serve(load.clone(), &produce.control_addr, shutdown.clone()).await;
    // The server also returns early when it fails to bind
    shutdown.cancel();

    let stats = load.stop().await;
    bus.close().await;
    if let Some((min, max, elapsed)) = join_reporter(reporter_task).await {
        info!(
            "Producer ran {:.1}s, window rates min {:.1} max {:.1} msg/s",
            elapsed.as_secs_f64(),
            min,
            max
        );
    }
    info!(
        "Producer finished: sent={} successful={} failed={}",
        stats.messages_sent, stats.messages_successful, stats.messages_failed
    );
    served.with_context(|| format!("Control API on {} failed", produce.control_addr))
}

async fn run_consume(args: &Args, consume: &ConsumeArgs) -> Result<()> {
    if consume.lanes == 0 {
        return Err(anyhow!("At least one consumer lane is required"));
    }
    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    let store: Arc<dyn TransactionStore> = match &consume.journal {
        Some(path) => {
            let journal = JournalStore::open(path)
                .with_context(|| format!("Failed to open journal {}", path.display()))?;
            info!(
                "Using transaction journal {} ({} records)",
                path.display(),
                journal.count().await?
            );
            Arc::new(journal)
        }
        None => {
            warn!("No journal configured, transaction records are kept in memory only");
            Arc::new(InMemoryStore::new())
        }
    };

    let producer_client = connect(&args.broker).await?;
    let api_versions = producer_client.api_versions.clone();
    let bus = Arc::new(KafkaBus::start(producer_client, KafkaBusConfig::default())?);
    let sink_bus: Arc<dyn BusProducer> = bus.clone();
    let dead_letters = Arc::new(DeadLetterSink::new(
        sink_bus,
        consume.failure_topics.dlq_topic.clone(),
        consume.failure_topics.error_topic.clone(),
    ));

    let service = Arc::new(HttpAccountService::new(
        &consume.downstream_url,
        Duration::from_millis(consume.connect_timeout_ms),
        Duration::from_millis(consume.request_timeout_ms),
    )?);
    info!("Delivering to {}", service.endpoint());

    let coordinator = RetryCoordinator::new(consume.backoff_policy()?, consume.classifier());
    let processor = Arc::new(MessageProcessor::new(ProcessorParts {
        store: store.clone(),
        service,
        coordinator,
        dead_letters: dead_letters.clone(),
        shutdown: shutdown.clone(),
    }));

    let reporter_processor = processor.clone();
    let summary_processor = processor.clone();
    let reporter = StatsReporter::new(
        "consumed",
        Duration::from_secs(consume.report_interval_secs.max(1)),
        move || reporter_processor.stats().consumed.load(Ordering::Relaxed),
        move || {
            let s = summary_processor.snapshot();
            format!(
                "consumed={} succeeded={} failed={} retries={} dlq={} error={} undecodable={}",
                s.consumed,
                s.succeeded,
                s.failed,
                s.retries,
                s.dead_lettered,
                s.error_routed,
                s.undecodable
            )
        },
    );
    let reporter_task = reporter.spawn(shutdown.clone());

    // One connection per lane: fetches hold the connection for up to max_wait
    let mut lanes = JoinSet::new();
    for lane in 0..consume.lanes {
        let client = Arc::new(
            KafkaClient::connect_with_versions(&args.broker, api_versions.clone()).await?,
        );
        let consumer = PartitionLane::new(
            client,
            store.clone(),
            processor.clone(),
            LaneConfig::new(args.topic.clone(), args.partitions, lane, consume.lanes),
            shutdown.clone(),
        );
        lanes.spawn(async move { consumer.run().await });
    }

    let mut failure = None;
    while let Some(joined) = lanes.join_next().await {
        let result = joined.map_err(anyhow::Error::from).and_then(|r| r);
        if let Err(e) = result {
            error!("Consumer lane failed, stopping: {:#}", e);
            shutdown.cancel();
            failure.get_or_insert(e);
        }
    }
    shutdown.cancel();

    dead_letters.flush().await;
    bus.close().await;
    join_reporter(reporter_task).await;

    let s = processor.snapshot();
    info!(
        "Consumer finished: consumed={} succeeded={} failed={} retries={} undecodable={}",
        s.consumed, s.succeeded, s.failed, s.retries, s.undecodable
    );
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn run_create_topics(args: &Args, topics: &TopicArgs) -> Result<()> {
    let client = connect(&args.broker).await?;
    for topic in [
        &args.topic,
        &topics.failure_topics.dlq_topic,
        &topics.failure_topics.error_topic,
    ] {
        client
            .create_topic(topic, args.partitions, topics.replication_factor)
            .await
            .map_err(|e| anyhow!("Topic creation failed: {}", e))?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.quiet);

    match &args.command {
        Command::Produce(produce) => run_produce(&args, produce).await,
        Command::Consume(consume) => run_consume(&args, consume).await,
        Command::CreateTopics(topics) => run_create_topics(&args, topics).await,
    }
}
