//! Websocket transport for the bridge.
//!
//! Text frames are always JSON. Binary frames go through [`wire::decode`],
//! which sniffs the first byte. A viewer that talks JSON gets JSON back.

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use sector_ingest_core::Shutdown;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use wire::{Encoding, Envelope};

use crate::{Bridge, BridgeError};

pub async fn bind(addr: &str) -> Result<TcpListener, BridgeError> {
    let listener = TcpListener::bind(addr).await.with_context(|| format!("bind {addr}"))?;
    Ok(listener)
}

/// Accepts viewers until `shutdown` flips, then closes every connection.
pub async fn serve(bridge: Bridge, listener: TcpListener, mut shutdown: Shutdown) -> Result<(), BridgeError> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "bridge listening");
    }
    while !*shutdown.borrow() {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let bridge = bridge.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_socket(bridge, stream).await {
                            debug!(error = %e, %peer, "viewer connection ended with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
        }
    }
    bridge.shutdown();
    Ok(())
}

fn to_message(env: &Envelope, encoding: Encoding) -> Option<Message> {
    let bytes = match wire::encode(env, encoding) {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "failed to encode envelope");
            return None;
        }
    };
    match encoding {
        Encoding::Protobuf => Some(Message::binary(bytes)),
        Encoding::Json => String::from_utf8(bytes).ok().map(Message::text),
    }
}

async fn handle_socket(bridge: Bridge, stream: TcpStream) -> Result<(), BridgeError> {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(bridge.config().max_message_size);
    config.max_frame_size = Some(bridge.config().max_message_size);
    let ws = tokio_tungstenite::accept_async_with_config(stream, Some(config)).await?;
    let (mut sink, mut incoming) = ws.split();

    let viewer = bridge.connect()?;
    let mut encoding = bridge.config().encoding;

    loop {
        tokio::select! {
            out = viewer.recv() => {
                let Some(env) = out else { break };
                let Some(msg) = to_message(&env, encoding) else { continue };
                if let Err(e) = sink.send(msg).await {
                    debug!(error = %e, connection = viewer.id(), "send failed");
                    break;
                }
            }
            msg = incoming.next() => {
                let decoded = match msg {
                    Some(Ok(Message::Text(text))) => {
                        encoding = Encoding::Json;
                        wire::decode_as(text.as_bytes(), Encoding::Json)
                    }
                    Some(Ok(Message::Binary(bin))) => wire::decode(&bin),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(error = %e, connection = viewer.id(), "websocket read failed");
                        break;
                    }
                };
                match decoded {
                    Ok(env) => viewer.handle(env),
                    Err(e) => debug!(error = %e, connection = viewer.id(), "ignoring malformed client message"),
                }
            }
        }
    }

    drop(viewer);
    let _ = sink.close().await;
    Ok(())
}
