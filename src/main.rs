//! CLI for the pub/sub brew
//!
//! Subcommands:
//! - `demo`: run brewers and patrons against the in-memory transport
//! - `config`: print the resolved settings and credential source

use std::env;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use pubsub_brew::config::credentials::{self, CREDENTIALS_ENV_VAR};
use pubsub_brew::config::{BrewContext, Settings, load_config};
use pubsub_brew::transport::MemoryTransport;
use pubsub_brew::{Brew, BrewerDescriptor, DataCallback, PatronDescriptor, PubSubBrew};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "pubsub-brew")]
enum Command {
    /// Publish through the brew and consume with several patrons, in process
    Demo {
        /// Topic the demo brewer publishes on
        #[arg(long, default_value = "demo-topic")]
        topic: String,
        /// Number of patrons subscribing to the topic
        #[arg(long, default_value_t = 2)]
        patrons: usize,
        /// Number of messages to publish
        #[arg(long, default_value_t = 3)]
        messages: usize,
    },
    /// Print the resolved configuration
    Config,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            pubsub_brew::utils::logging::init("info");
            error!("Failed to load configuration: {}", e);
            return;
        }
    };
    pubsub_brew::utils::logging::init(&settings.logging.level);

    match cmd {
        Command::Demo {
            topic,
            patrons,
            messages,
        } => {
            if let Err(e) = run_demo(settings, &topic, patrons, messages).await {
                error!("Demo failed: {}", e);
            }
        }
        Command::Config => {
            if let Err(e) = show_config(&settings) {
                error!("Could not print configuration: {}", e);
            }
        }
    }
}

async fn run_demo(
    settings: Settings,
    topic: &str,
    patrons: usize,
    messages: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let transport = MemoryTransport::new();
    let mut brew =
        PubSubBrew::new(Arc::new(transport.clone())).with_defaults(settings.pubsub.clone());

    let mut context = BrewContext::new();
    if settings.pubsub.project_id.is_none() {
        context.insert("project_id".to_string(), "brew-demo".to_string());
    }
    brew.configure(&context)?;

    let brewer = BrewerDescriptor::new("demo-brewer", topic);
    brew.create_brewer(&brewer).await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<(String, String, Bytes)>();
    let patron_ids: Vec<String> = (0..patrons).map(|i| format!("patron-{i}")).collect();
    for patron_id in &patron_ids {
        brew.create_patron(&PatronDescriptor::new(patron_id, topic))
            .await?;

        let tx = tx.clone();
        let id = patron_id.clone();
        let on_data: DataCallback = Arc::new(move |brewer_id: &str, data: Bytes| {
            let _ = tx.send((id.clone(), brewer_id.to_string(), data));
        });
        brew.start_patron(
            patron_id,
            topic,
            &brewer.brewer_id,
            &Value::Null,
            &Value::Null,
            on_data,
        )
        .await;
    }
    drop(tx);

    for n in 0..messages {
        let payload = Bytes::from(format!("message {n}"));
        brew.brew(&brewer.brewer_id, topic, payload, &patron_ids)
            .await?;
    }

    let expected = patrons * messages;
    let mut received = 0;
    while received < expected {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some((patron_id, brewer_id, data))) => {
                received += 1;
                info!(
                    "{patron_id} received {:?} from {brewer_id}",
                    String::from_utf8_lossy(&data)
                );
            }
            Ok(None) => break,
            Err(_) => {
                warn!("Timed out waiting for deliveries ({received}/{expected})");
                break;
            }
        }
    }

    for patron_id in &patron_ids {
        brew.stop_patron(patron_id, topic, &brewer.brewer_id).await;
        brew.destroy_patron(&PatronDescriptor::new(patron_id, topic))
            .await;
    }
    brew.stop().await;

    let stats = transport.stats();
    info!(
        received,
        topics_created = stats.topics_created,
        subscriptions_created = stats.subscriptions_created,
        subscriptions_deleted = stats.subscriptions_deleted,
        published = stats.published,
        acknowledged = stats.acknowledged,
        "Demo finished"
    );
    Ok(())
}

fn show_config(settings: &Settings) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(settings)?);

    let ambient = env::var(CREDENTIALS_ENV_VAR).ok();
    let source = credentials::resolve(
        settings.pubsub.service_account_file.as_deref(),
        ambient.as_deref(),
    );
    println!("credentials: {source:?}");
    Ok(())
}
