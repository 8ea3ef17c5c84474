use super::wire::{self, ControlMessage, WireMessage};
use super::{ConnectRequest, GatewayConnector, GatewayLink, LinkEvent, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

const LOOPBACK_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopbackBehaviour {
    Accept,
    Refuse,
    Stall,
}

pub struct LoopbackConnector {
    behaviour: Mutex<LoopbackBehaviour>,
    requests: Mutex<Vec<ConnectRequest>>,
    peers: mpsc::UnboundedSender<LoopbackPeer>,
}

impl LoopbackConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<LoopbackPeer>) {
        let (peers, accepted) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            behaviour: Mutex::new(LoopbackBehaviour::Accept),
            requests: Mutex::new(Vec::new()),
            peers,
        });
        (connector, accepted)
    }

    pub fn echo() -> Arc<Self> {
        let (connector, mut accepted) = Self::new();
        tokio::spawn(async move {
            while let Some(peer) = accepted.recv().await {
                tokio::spawn(run_echo(peer));
            }
        });
        connector
    }

    pub fn set_behaviour(&self, behaviour: LoopbackBehaviour) {
        *self.behaviour.lock().unwrap_or_else(PoisonError::into_inner) = behaviour;
    }

    pub fn requests(&self) -> Vec<ConnectRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl GatewayConnector for LoopbackConnector {
    async fn open(&self, request: ConnectRequest) -> Result<GatewayLink, TransportError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        let behaviour = *self.behaviour.lock().unwrap_or_else(PoisonError::into_inner);
        match behaviour {
            LoopbackBehaviour::Refuse => {
                Err(TransportError::Refused("loopback refused".to_string()))
            }
            LoopbackBehaviour::Stall => std::future::pending().await,
            LoopbackBehaviour::Accept => {
                let (outbound, from_client) = mpsc::channel(LOOPBACK_QUEUE);
                let (to_client, inbound) = mpsc::channel(LOOPBACK_QUEUE);
                let peer = LoopbackPeer {
                    request,
                    from_client,
                    to_client,
                };
                self.peers
                    .send(peer)
                    .map_err(|_| TransportError::Refused("no loopback listener".to_string()))?;
                Ok(GatewayLink { outbound, inbound })
            }
        }
    }
}

pub struct LoopbackPeer {
    pub request: ConnectRequest,
    from_client: mpsc::Receiver<WireMessage>,
    to_client: mpsc::Sender<LinkEvent>,
}

impl LoopbackPeer {
    pub async fn send(&self, message: WireMessage) -> bool {
        self.to_client
            .send(LinkEvent::Message(message))
            .await
            .is_ok()
    }

    pub async fn send_bytes(&self, bytes: &[u8]) -> bool {
        self.send(WireMessage::Binary(Bytes::copy_from_slice(bytes)))
            .await
    }

    pub async fn send_text(&self, text: &str) -> bool {
        self.send(WireMessage::Text(text.to_string())).await
    }

    pub async fn send_control(&self, control: ControlMessage) -> bool {
        self.send(control.into()).await
    }

    pub async fn send_frame(&self, width: u32, height: u32, image: &[u8]) -> bool {
        self.send(wire::encode_frame(width, height, image)).await
    }

    pub async fn close(&self, clean: bool) {
        let reason = if clean { "session ended" } else { "network lost" };
        let _ = self
            .to_client
            .send(LinkEvent::Closed {
                clean,
                reason: reason.to_string(),
            })
            .await;
    }

    pub async fn recv(&mut self) -> Option<WireMessage> {
        self.from_client.recv().await
    }

    pub async fn recv_bytes(&mut self) -> Option<Bytes> {
        while let Some(message) = self.from_client.recv().await {
            if let WireMessage::Binary(bytes) = message {
                return Some(bytes);
            }
        }
        None
    }

    pub async fn recv_control(&mut self) -> Option<ControlMessage> {
        while let Some(message) = self.from_client.recv().await {
            if let Some(control) = as_control(message) {
                return Some(control);
            }
        }
        None
    }

    pub fn try_recv_control(&mut self) -> Option<ControlMessage> {
        while let Ok(message) = self.from_client.try_recv() {
            if let Some(control) = as_control(message) {
                return Some(control);
            }
        }
        None
    }
}

fn as_control(message: WireMessage) -> Option<ControlMessage> {
    match message {
        WireMessage::Text(text) => serde_json::from_str(&text).ok(),
        WireMessage::Binary(_) => None,
    }
}

async fn run_echo(mut peer: LoopbackPeer) {
    let banner = format!(
        "loopback {} session {}\r\n$ ",
        peer.request.mode.as_str(),
        peer.request.session_id
    );
    if !peer.send_bytes(banner.as_bytes()).await {
        return;
    }
    while let Some(message) = peer.recv().await {
        let delivered = match message {
            WireMessage::Binary(bytes) => {
                let echoed: Vec<u8> = bytes
                    .iter()
                    .flat_map(|&byte| match byte {
                        b'\r' | b'\n' => b"\r\n$ ".to_vec(),
                        other => vec![other],
                    })
                    .collect();
                peer.send_bytes(&echoed).await
            }
            WireMessage::Text(text) => match serde_json::from_str(&text) {
                Ok(ControlMessage::Ping { nonce }) => {
                    peer.send_control(ControlMessage::Pong { nonce }).await
                }
                _ => true,
            },
        };
        if !delivered {
            return;
        }
    }
}
