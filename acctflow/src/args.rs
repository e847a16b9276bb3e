//! Command-line arguments for acctflow
//!
//! Every option can also be set through the environment variable named next to it.

use crate::classify::ErrorClassifier;
use crate::retry::{BackoffPolicy, PolicyError};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "acctflow")]
#[command(about = "Account-event pipeline: rate-controlled producer and reliable consumer")]
pub struct Args {
    /// Kafka broker address
    #[arg(short, long, global = true, env = "ACCTFLOW_BROKER", default_value = "localhost:9092")]
    pub broker: String,

    /// Account event topic
    #[arg(short, long, global = true, env = "ACCTFLOW_TOPIC", default_value = "accounts")]
    pub topic: String,

    /// Number of partitions of the account topic
    #[arg(short, long, global = true, env = "ACCTFLOW_PARTITIONS", default_value = "1")]
    pub partitions: i32,

    /// Only log warnings and errors
    #[arg(short, long, global = true, env = "ACCTFLOW_QUIET", default_value = "false")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Publish generated account events at a controlled rate
    Produce(ProduceArgs),
    /// Deliver account events to the downstream service
    Consume(ConsumeArgs),
    /// Create the account, dead-letter and error topics
    CreateTopics(TopicArgs),
}

#[derive(ClapArgs, Debug, Clone)]
pub struct FailureTopics {
    /// Topic for messages whose retries ran out
    #[arg(long, env = "ACCTFLOW_DLQ_TOPIC", default_value = "accounts-dlq")]
    pub dlq_topic: String,

    /// Topic for messages that failed without being retryable
    #[arg(long, env = "ACCTFLOW_ERROR_TOPIC", default_value = "accounts-error")]
    pub error_topic: String,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ProduceArgs {
    /// Initial publish rate in messages per second (1-10000)
    #[arg(short, long, env = "ACCTFLOW_RATE", default_value = "10")]
    pub rate: u32,

    /// Start publishing immediately instead of waiting for a start request
    #[arg(long, env = "ACCTFLOW_AUTOSTART", default_value = "false")]
    pub autostart: bool,

    /// Required acknowledgements: 1 (leader) or -1 (all in-sync replicas)
    #[arg(long, env = "ACCTFLOW_ACKS", default_value = "1", allow_hyphen_values = true)]
    pub acks: i16,

    /// How long to wait for more records before sending a batch
    #[arg(long, env = "ACCTFLOW_LINGER_MS", default_value = "5")]
    pub linger_ms: u64,

    /// Flush a batch once it reaches this many bytes
    #[arg(long, env = "ACCTFLOW_BATCH_BYTES", default_value = "16384")]
    pub batch_bytes: usize,

    /// Listen address of the producer control API
    #[arg(long, env = "ACCTFLOW_CONTROL_ADDR", default_value = "0.0.0.0:8080")]
    pub control_addr: String,

    /// Seconds between stats log lines
    #[arg(long, env = "ACCTFLOW_REPORT_INTERVAL_SECS", default_value = "10")]
    pub report_interval_secs: u64,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ConsumeArgs {
    #[command(flatten)]
    pub failure_topics: FailureTopics,

    /// Base URL of the downstream account service
    #[arg(long, env = "ACCTFLOW_DOWNSTREAM_URL", default_value = "http://localhost:8089")]
    pub downstream_url: String,

    /// Downstream connect timeout in milliseconds
    #[arg(long, env = "ACCTFLOW_CONNECT_TIMEOUT_MS", default_value = "5000")]
    pub connect_timeout_ms: u64,

    /// Downstream request timeout in milliseconds
    #[arg(long, env = "ACCTFLOW_REQUEST_TIMEOUT_MS", default_value = "10000")]
    pub request_timeout_ms: u64,

    /// Retries after the first failed attempt
    #[arg(long, env = "ACCTFLOW_MAX_RETRIES", default_value = "3")]
    pub max_retries: u32,

    /// First backoff delay in milliseconds
    #[arg(long, env = "ACCTFLOW_BACKOFF_INITIAL_MS", default_value = "1000")]
    pub backoff_initial_ms: u64,

    /// Backoff growth factor per retry
    #[arg(long, env = "ACCTFLOW_BACKOFF_MULTIPLIER", default_value = "2.0")]
    pub backoff_multiplier: f64,

    /// Upper bound for a single backoff delay in milliseconds
    #[arg(long, env = "ACCTFLOW_BACKOFF_MAX_MS", default_value = "10000")]
    pub backoff_max_ms: u64,

    /// Number of sequential processing lanes
    #[arg(long, env = "ACCTFLOW_LANES", default_value = "1")]
    pub lanes: usize,

    /// Retry unexpected failures instead of routing them to the error topic
    #[arg(long, env = "ACCTFLOW_RETRY_UNEXPECTED", default_value = "false")]
    pub retry_unexpected: bool,

    /// Transaction journal file; records are kept in memory when absent
    #[arg(long, env = "ACCTFLOW_JOURNAL")]
    pub journal: Option<PathBuf>,

    /// Seconds between stats log lines
    #[arg(long, env = "ACCTFLOW_REPORT_INTERVAL_SECS", default_value = "10")]
    pub report_interval_secs: u64,
}

impl ConsumeArgs {
    pub fn backoff_policy(&self) -> Result<BackoffPolicy, PolicyError> {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff_initial_ms),
            self.backoff_multiplier,
            Duration::from_millis(self.backoff_max_ms),
            self.max_retries,
        )
    }

    pub fn classifier(&self) -> ErrorClassifier {
        ErrorClassifier::new(self.retry_unexpected)
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct TopicArgs {
    #[command(flatten)]
    pub failure_topics: FailureTopics,

    /// Replication factor of the created topics
    #[arg(long, env = "ACCTFLOW_REPLICATION_FACTOR", default_value = "1")]
    pub replication_factor: i16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_defaults() {
        let args = Args::try_parse_from(["acctflow", "consume"]).unwrap();
        assert_eq!(args.broker, "localhost:9092");
        assert_eq!(args.topic, "accounts");
        assert_eq!(args.partitions, 1);
        let Command::Consume(consume) = args.command else {
            panic!("expected consume");
        };
        assert_eq!(consume.failure_topics.dlq_topic, "accounts-dlq");
        assert_eq!(consume.failure_topics.error_topic, "accounts-error");
        assert_eq!(consume.downstream_url, "http://localhost:8089");
        assert_eq!(consume.lanes, 1);
        assert!(!consume.retry_unexpected);
        assert!(consume.journal.is_none());
        assert_eq!(consume.backoff_policy().unwrap(), BackoffPolicy::default());
    }

    #[test]
    fn test_produce_options() {
        let args = Args::try_parse_from([
            "acctflow",
            "produce",
            "--rate",
            "250",
            "--acks",
            "-1",
            "--broker",
            "kafka:29092",
        ])
        .unwrap();
        assert_eq!(args.broker, "kafka:29092");
        let Command::Produce(produce) = args.command else {
            panic!("expected produce");
        };
        assert_eq!(produce.rate, 250);
        assert_eq!(produce.acks, -1);
        assert_eq!(produce.linger_ms, 5);
        assert_eq!(produce.batch_bytes, 16384);
        assert_eq!(produce.control_addr, "0.0.0.0:8080");
    }

    #[test]
    fn test_invalid_backoff_is_reported() {
        let args = Args::try_parse_from([
            "acctflow",
            "consume",
            "--backoff-multiplier",
            "0.5",
        ])
        .unwrap();
        let Command::Consume(consume) = args.command else {
            panic!("expected consume");
        };
        assert!(consume.backoff_policy().is_err());
    }

    #[test]
    fn test_create_topics_subcommand() {
        let args = Args::try_parse_from(["acctflow", "create-topics", "--partitions", "6"]).unwrap();
        assert_eq!(args.partitions, 6);
        assert!(matches!(args.command, Command::CreateTopics(_)));
    }
}
