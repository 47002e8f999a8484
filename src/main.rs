use anyhow::Context;
use clap::Parser;
use keycloak_kafka::kafka::KafkaProducerProvider;
use keycloak_kafka::keycloak::{AdminEvent, Event};
use keycloak_kafka::{BridgeConfig, EventListener, KafkaEventListener};
use serde::Deserialize;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "keycloak-kafka")]
#[command(about = "Publish Keycloak events to Kafka", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Newline-delimited JSON events to publish; reads stdin when omitted
    #[arg(short, long, value_name = "FILE")]
    input: Option<PathBuf>,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

/// One input line: a standard event or an admin event.
#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum InputEvent {
    Event(Event),
    Admin {
        #[serde(flatten)]
        event: AdminEvent,
        #[serde(default = "include_representation_default", rename = "includeRepresentation")]
        include_representation: bool,
    },
}

fn include_representation_default() -> bool {
    true
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting keycloak-kafka");

    let config = BridgeConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;

    info!(
        bootstrap_servers = %config.bootstrap_servers,
        client_id = %config.client_id,
        events_topic = %config.events_topic,
        admin_events_topic = %config.admin_events_topic,
        "Configuration summary"
    );

    let provider = KafkaProducerProvider::new(config.producer.metadata_timeout());
    let bridge = tokio::task::block_in_place(|| KafkaEventListener::start(config, &provider))
        .context("Failed to start Kafka event listener")?;

    let published = match &args.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open {:?}", path))?;
            replay(&bridge, file).await?
        }
        None => replay(&bridge, tokio::io::stdin()).await?,
    };

    let report = tokio::task::block_in_place(|| bridge.shutdown());
    info!(
        published,
        delivered = report.delivered,
        failed = report.failed,
        abandoned = report.abandoned,
        "Done"
    );

    if report.failed > 0 || report.abandoned > 0 {
        anyhow::bail!(
            "{} events failed and {} were abandoned",
            report.failed,
            report.abandoned
        );
    }
    Ok(())
}

/// Feeds every line of `input` to the bridge until EOF or Ctrl-C.
async fn replay<R>(bridge: &KafkaEventListener, input: R) -> anyhow::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(input).lines();
    let mut published = 0u64;
    let mut line_no = 0u64;
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read input")?,
            _ = &mut interrupted => {
                warn!("Interrupted, draining");
                break;
            }
        };
        let Some(line) = line else { break };
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<InputEvent>(&line) {
            Ok(InputEvent::Event(event)) => bridge.on_event(&event),
            Ok(InputEvent::Admin {
                event,
                include_representation,
            }) => bridge.on_admin_event(&event, include_representation),
            Err(e) => {
                error!(line = line_no, error = %e, "Skipping malformed event");
                continue;
            }
        }
        published += 1;
    }

    Ok(published)
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("keycloak_kafka=debug,librdkafka=info,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("keycloak_kafka=info,librdkafka=warn,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
