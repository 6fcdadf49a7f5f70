use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use pushlink::discovery::EndpointResolver;
use pushlink::{
    Callbacks, Client, ClientConfig, ClientError, ComputerConnectionsQuery, ConnectionState, ErrorCode,
    ScalesMeasurement, ScalesQuery, SubscribeOptions, handler,
};
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("invalid query: {0}")]
    InvalidQuery(&'static str),
    #[error("connection ended before authentication ({0})")]
    NotAuthenticated(ConnectionState),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "pushlink", about = "Realtime push service client")]
struct Cli {
    #[arg(long, env = "PUSHLINK_API_KEY")]
    api_key: String,

    /// Connect to this host directly instead of running discovery.
    #[arg(long, env = "PUSHLINK_SERVER")]
    server: Option<String>,

    /// Request an ack for every message sent.
    #[arg(long, default_value_t = false)]
    ack: bool,

    /// Stop after this many seconds; runs until interrupted otherwise.
    #[arg(long)]
    duration: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the endpoint discovery would connect to.
    Resolve,
    /// Stream scale measurements.
    Scales(ScalesArgs),
    /// Stream computer connection changes.
    Connections(ConnectionsArgs),
    /// Print every local publish on the given topics.
    Watch {
        #[arg(required = true)]
        topics: Vec<String>,
    },
}

#[derive(Args, Debug)]
struct ScalesArgs {
    #[arg(long)]
    computer_id: Option<u64>,
    #[arg(long, requires = "computer_id")]
    device_name: Option<String>,
    #[arg(long, requires = "device_name")]
    device_num: Option<u64>,
}

#[derive(Args, Debug)]
struct ConnectionsArgs {
    #[arg(long)]
    computer_id: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = ClientConfig::new(cli.api_key).with_ack(cli.ack);
    config.server = cli.server;
    let limit = cli.duration.map(Duration::from_secs);

    match cli.command {
        Command::Resolve => run_resolve(&config).await,
        Command::Scales(args) => run_scales(config, args, limit).await,
        Command::Connections(args) => run_connections(config, args, limit).await,
        Command::Watch { topics } => run_watch(config, topics, limit).await,
    }
}

async fn run_resolve(config: &ClientConfig) -> Result<(), CliError> {
    config.validate()?;
    let endpoint = EndpointResolver::new(config)?.resolve(config.server.as_deref()).await;
    let source = match &endpoint.source {
        pushlink::discovery::EndpointSource::Explicit => "explicit".to_owned(),
        pushlink::discovery::EndpointSource::Discovered => "discovered".to_owned(),
        pushlink::discovery::EndpointSource::Fallback { reason } => format!("fallback: {reason}"),
    };
    print_json(&serde_json::json!({
        "host": endpoint.host,
        "url": config.ws_url(&endpoint.host),
        "source": source,
    }))
}

async fn run_scales(config: ClientConfig, args: ScalesArgs, limit: Option<Duration>) -> Result<(), CliError> {
    let query = match (args.computer_id, args.device_name, args.device_num) {
        (None, None, None) => ScalesQuery::All,
        (Some(computer_id), None, None) => ScalesQuery::Computer { computer_id },
        (Some(computer_id), Some(device_name), None) => ScalesQuery::Device { computer_id, device_name },
        (Some(computer_id), Some(device_name), Some(device_num)) => {
            ScalesQuery::DeviceNum { computer_id, device_name, device_num }
        }
        _ => return Err(CliError::InvalidQuery("device options need --computer-id and --device-name")),
    };

    let (client, mut rx) = connect_watching(config, &[pushlink::paths::SCALES_TOPIC.to_owned()]).await?;
    let id = client.get_scales(query, None, None).await?;
    eprintln!("subscribed to scales (subscription {id})");

    stream(&client, &mut rx, limit, |_, payload| {
        let latency_ms = ScalesMeasurement::from_value(payload)
            .ok()
            .and_then(|m| m.latency())
            .map(|d| d.num_milliseconds());
        print_json(&serde_json::json!({ "measurement": payload, "latencyMs": latency_ms }))
    })
    .await
}

async fn run_connections(
    config: ClientConfig,
    args: ConnectionsArgs,
    limit: Option<Duration>,
) -> Result<(), CliError> {
    let query = match args.computer_id {
        Some(computer_id) => ComputerConnectionsQuery::Computer { computer_id },
        None => ComputerConnectionsQuery::All,
    };

    let topic = pushlink::paths::COMPUTER_CONNECTIONS_TOPIC.to_owned();
    let (client, mut rx) = connect_watching(config, &[topic]).await?;
    let id = client.get_computer_connections(query, None, None).await?;
    eprintln!("subscribed to computer connections (subscription {id})");

    stream(&client, &mut rx, limit, |_, payload| print_json(payload)).await
}

async fn run_watch(config: ClientConfig, topics: Vec<String>, limit: Option<Duration>) -> Result<(), CliError> {
    let (client, mut rx) = connect_watching(config, &topics).await?;
    stream(&client, &mut rx, limit, |topic, payload| {
        print_json(&serde_json::json!({ "topic": topic, "payload": payload }))
    })
    .await
}

/// Connect, forward publishes on `topics` to a channel, and wait for auth.
async fn connect_watching(
    config: ClientConfig,
    topics: &[String],
) -> Result<(Client, mpsc::UnboundedReceiver<(String, Value)>), CliError> {
    let callbacks = Callbacks::default().on_error(|err, detail| {
        eprintln!("error [{}]: {err} {detail}", err.error_code());
        Ok(())
    });
    let client = Client::connect(config, callbacks)?;

    let (tx, rx) = mpsc::unbounded_channel();
    for topic in topics {
        let tx = tx.clone();
        let forward = handler(move |payload, delivery| {
            let _ = tx.send((delivery.topic.to_string(), payload.clone()));
            Ok(())
        });
        client.subscribe(topic.as_str(), forward, SubscribeOptions::default()).await?;
    }

    let state = client
        .wait_for_state(|s| !matches!(s, ConnectionState::NotStarted | ConnectionState::Authenticating))
        .await?;
    if state != ConnectionState::Authenticated {
        return Err(CliError::NotAuthenticated(state));
    }
    Ok((client, rx))
}

async fn stream(
    client: &Client,
    rx: &mut mpsc::UnboundedReceiver<(String, Value)>,
    limit: Option<Duration>,
    mut print: impl FnMut(&str, &Value) -> Result<(), CliError>,
) -> Result<(), CliError> {
    let deadline = tokio::time::sleep(limit.unwrap_or(Duration::MAX));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            Some((topic, payload)) = rx.recv() => print(&topic, &payload)?,
            _ = client.wait_for_state(|s| s.is_terminal()) => {
                eprintln!("connection closed");
                return Ok(());
            }
            () = &mut deadline, if limit.is_some() => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.close().await?;
    Ok(())
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string(value)?;
    println!("{rendered}");
    Ok(())
}
