//! hublink - command-line client for the hublink MQTT helper

use std::io::{self, Read};
use std::time::Duration;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use hublink_client::{
    AckResult, Callbacks, ConnectReturnCode, DisconnectReason, MqttHelper, PublishParams, QoS,
    Subscription,
};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{info, warn};

mod common;
mod config;

use common::{init_logging, parse_qos, ConnectionArgs};

const ACK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "hublink")]
#[command(about = "MQTT command-line client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Publish a message to a topic
    Pub {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Topic to publish to
        #[arg(short = 't', long)]
        topic: String,

        /// Message payload (reads from stdin if not provided)
        #[arg(short = 'm', long)]
        message: Option<String>,

        /// QoS level (0 or 1)
        #[arg(short = 'q', long, default_value = "0")]
        qos: u8,

        /// Retain the message on the broker
        #[arg(short = 'r', long)]
        retain: bool,
    },
    /// Subscribe to topics and print messages
    Sub {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Topic(s) to subscribe to (can be specified multiple times)
        #[arg(short = 't', long, required = true)]
        topic: Vec<String>,

        /// QoS level for subscriptions (0, 1, or 2)
        #[arg(short = 'q', long, default_value = "0")]
        qos: u8,

        /// Print topic name before each message
        #[arg(short = 'T', long)]
        print_topic: bool,
    },
}

/// Callback events forwarded to the command task.
#[derive(Debug)]
enum Notice {
    ConnAck(ConnectReturnCode),
    Disconnected(DisconnectReason),
    Message(String, Vec<u8>),
    PubAck(u16),
    SubAck(u16, AckResult),
    Error(String),
}

fn forwarding_callbacks(tx: mpsc::UnboundedSender<Notice>) -> Callbacks {
    let connack = tx.clone();
    let disconnect = tx.clone();
    let publish = tx.clone();
    let puback = tx.clone();
    let suback = tx.clone();
    let error = tx;

    Callbacks::new()
        .on_connack(move |code| {
            let _ = connack.send(Notice::ConnAck(code));
        })
        .on_disconnect(move |reason| {
            let _ = disconnect.send(Notice::Disconnected(reason));
        })
        .on_publish(move |topic, payload| {
            let _ = publish.send(Notice::Message(topic.to_string(), payload.to_vec()));
        })
        .on_puback(move |id, _| {
            let _ = puback.send(Notice::PubAck(id));
        })
        .on_suback(move |id, result| {
            let _ = suback.send(Notice::SubAck(id, result));
        })
        .on_error(move |indication| {
            let _ = error.send(Notice::Error(format!("{:?}", indication)));
        })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Pub {
            connection,
            topic,
            message,
            qos,
            retain,
        } => {
            run_publish(connection, topic, message, qos, retain).await?;
        }
        Commands::Sub {
            connection,
            topic,
            qos,
            print_topic,
        } => {
            run_subscribe(connection, topic, qos, print_topic).await?;
        }
    }

    Ok(())
}

/// Connect and wait until the broker accepts the session.
async fn open(
    connection: &ConnectionArgs,
) -> Result<(MqttHelper, mpsc::UnboundedReceiver<Notice>), Box<dyn std::error::Error>> {
    let session = connection.load()?;
    init_logging(connection.verbose, &session.log_level);

    let helper = session.helper()?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    helper.init(forwarding_callbacks(tx))?;
    helper.connect(&session.params).await?;

    loop {
        match timeout(ACK_TIMEOUT, rx.recv()).await {
            Ok(Some(Notice::ConnAck(ConnectReturnCode::Success))) => break,
            Ok(Some(Notice::ConnAck(code))) => {
                return Err(format!("Connection refused: {:?}", code).into())
            }
            Ok(Some(Notice::Disconnected(reason))) => {
                return Err(format!("Disconnected: {:?}", reason).into())
            }
            Ok(Some(other)) => warn!("Unexpected event before CONNACK: {:?}", other),
            Ok(None) => return Err("Callbacks dropped".into()),
            Err(_) => return Err("Timed out waiting for CONNACK".into()),
        }
    }

    info!("Connected to {}", session.params.hostname());

    Ok((helper, rx))
}

/// Disconnect and wait for the worker to wind the session down.
async fn close(helper: &MqttHelper, rx: &mut mpsc::UnboundedReceiver<Notice>) {
    if let Err(e) = helper.disconnect().await {
        warn!("Disconnect failed: {}", e);
        return;
    }

    while let Ok(Some(notice)) = timeout(ACK_TIMEOUT, rx.recv()).await {
        if let Notice::Disconnected(_) = notice {
            break;
        }
    }
}

async fn run_publish(
    connection: ConnectionArgs,
    topic: String,
    message: Option<String>,
    qos_level: u8,
    retain: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    // Get the message payload
    let payload = match message {
        Some(msg) => msg,
        None => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };

    let qos = parse_qos(qos_level)?;
    if qos == QoS::ExactlyOnce {
        return Err("QoS 2 publishing is not supported".into());
    }

    let (helper, mut rx) = open(&connection).await?;

    let params = PublishParams::new(topic, Bytes::from(payload))
        .qos(qos)
        .retain(retain);
    let id = helper.publish(&params).await?;

    if qos == QoS::AtLeastOnce {
        loop {
            match timeout(ACK_TIMEOUT, rx.recv()).await {
                Ok(Some(Notice::PubAck(acked))) if acked == id => break,
                Ok(Some(Notice::Disconnected(reason))) => {
                    return Err(format!("Disconnected before PUBACK: {:?}", reason).into())
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => return Err("No PUBACK received".into()),
            }
        }
    }

    close(&helper, &mut rx).await;
    helper.deinit().await?;

    Ok(())
}

async fn run_subscribe(
    connection: ConnectionArgs,
    topics: Vec<String>,
    qos_level: u8,
    print_topic: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = parse_qos(qos_level)?;
    let (helper, mut rx) = open(&connection).await?;

    let subscriptions: Vec<Subscription> = topics
        .iter()
        .map(|topic| Subscription::new(topic.as_str(), qos))
        .collect();
    let id = helper.subscribe(&subscriptions).await?;

    // Handle Ctrl+C for graceful shutdown
    let lost = tokio::select! {
        _ = signal::ctrl_c() => {
            eprintln!("\nDisconnecting...");
            false
        }
        lost = async {
            while let Some(notice) = rx.recv().await {
                match notice {
                    Notice::Message(topic, payload) => {
                        if print_topic {
                            println!("{}: {}", topic, String::from_utf8_lossy(&payload));
                        } else {
                            println!("{}", String::from_utf8_lossy(&payload));
                        }
                    }
                    Notice::SubAck(acked, AckResult::Failure) if acked == id => {
                        eprintln!("Subscription refused by broker");
                    }
                    Notice::Error(indication) => eprintln!("Dropped message: {}", indication),
                    Notice::Disconnected(reason) => {
                        eprintln!("Disconnected: {:?}", reason);
                        return true;
                    }
                    _ => {}
                }
            }
            true
        } => lost,
    };

    if !lost {
        close(&helper, &mut rx).await;
    }
    helper.deinit().await?;

    Ok(())
}
