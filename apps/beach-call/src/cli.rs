use anyhow::Result;
use beach_call::protocol::{CallNotice, ServerMessage};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error};

#[derive(Parser, Debug)]
#[command(name = "beach-call")]
#[command(about = "Beach Call signaling server and probe clients")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the signaling server (default when no command is given)
    Serve,

    /// Connect and print every message the server pushes
    Watch {
        /// Signaling endpoint (e.g., ws://localhost:50001/ws)
        #[arg(short, long, default_value = "ws://localhost:50001/ws")]
        url: String,

        /// Stop after this many seconds
        #[arg(short, long, default_value_t = 30)]
        seconds: u64,
    },

    /// Place a call and wait for someone to answer it
    Offer {
        /// Signaling endpoint (e.g., ws://localhost:50001/ws)
        #[arg(short, long, default_value = "ws://localhost:50001/ws")]
        url: String,

        /// Call identifier, unique among active calls
        #[arg(short, long)]
        call_id: String,

        /// Offer payload; parsed as JSON when possible, sent as a string otherwise
        #[arg(short, long)]
        offer: String,

        /// Seconds to wait for an answer
        #[arg(short, long, default_value_t = 60)]
        wait: u64,
    },
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(url: &str) -> Result<Socket> {
    debug!("Connecting to {}", url);
    match timeout(Duration::from_secs(5), connect_async(url)).await {
        Ok(Ok((ws_stream, _))) => Ok(ws_stream),
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", url, e);
            Err(anyhow::anyhow!("Connection failed: {}", e))
        }
        Err(_) => {
            error!("Connection timeout after 5 seconds");
            Err(anyhow::anyhow!(
                "Connection timeout - is the signaling server running?"
            ))
        }
    }
}

fn parse_payload(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

pub async fn run_watch(url: String, seconds: u64) -> Result<()> {
    let ws_stream = connect(&url).await?;
    let (_write, mut read) = ws_stream.split();

    let watched = timeout(Duration::from_secs(seconds), async {
        while let Some(msg) = read.next().await {
            if let Message::Text(text) = msg? {
                println!("{}", text.as_str());
            }
        }
        Ok::<_, anyhow::Error>(())
    })
    .await;

    match watched {
        Ok(result) => result,
        Err(_) => {
            debug!("Watch window of {}s elapsed", seconds);
            Ok(())
        }
    }
}

pub async fn run_offer(url: String, call_id: String, offer: String, wait: u64) -> Result<()> {
    let ws_stream = connect(&url).await?;
    let (mut write, mut read) = ws_stream.split();

    let offer_msg = serde_json::json!({
        "call_id": call_id,
        "offer": parse_payload(&offer),
    });
    write
        .send(Message::Text(serde_json::to_string(&offer_msg)?.into()))
        .await?;

    let answered = timeout(Duration::from_secs(wait), async {
        while let Some(msg) = read.next().await {
            let Message::Text(text) = msg? else {
                continue;
            };
            match serde_json::from_str::<ServerMessage>(&text)? {
                ServerMessage::Welcome(welcome) => {
                    eprintln!("Connected as client {}", welcome.client_id);
                }
                ServerMessage::Notice(CallNotice::CallAnswered { call_id: id, answer })
                    if id == call_id =>
                {
                    return Ok::<_, anyhow::Error>(answer);
                }
                ServerMessage::Notice(CallNotice::IceCandidate {
                    call_id: id,
                    candidate,
                }) if id == call_id => {
                    eprintln!("Candidate: {}", candidate);
                }
                ServerMessage::Notice(CallNotice::CallEnded { call_id: id }) if id == call_id => {
                    return Err(anyhow::anyhow!("Call {} ended before it was answered", id));
                }
                _ => {}
            }
        }
        Err(anyhow::anyhow!("Connection closed unexpectedly"))
    })
    .await;

    match answered {
        Ok(Ok(answer)) => {
            println!("{}", serde_json::to_string_pretty(&answer)?);
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => {
            error!("No answer for call {} within {}s", call_id, wait);
            Err(anyhow::anyhow!("Call was not answered"))
        }
    }
}
