//! Bidirectional stream session with the switch management daemon.
//!
//! Two background tasks decouple the caller from the network stream: the
//! send task drains the unbounded outbound queue into the request stream,
//! and the receive task owns the `StreamChannel` call and pushes every
//! response into the unbounded inbound queue. The receive task issues the
//! call itself because the daemon only answers with headers once the first
//! request has been written.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::proto::{self, BfRuntimeClient, StreamMessageRequest, StreamMessageResponse};
use crate::proto::stream_message_response::Update;

/// Capacity of the channel between the send task and the wire stream.
const WIRE_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeState {
    Pending,
    Acked,
    Failed,
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Number of polling attempts.
    pub attempts: u32,
    /// Wait per attempt.
    pub timeout: Duration,
    pub is_master: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            attempts: 5,
            timeout: Duration::from_secs(1),
            is_master: true,
        }
    }
}

struct Inbound {
    rx: mpsc::UnboundedReceiver<StreamMessageResponse>,
    requeued: VecDeque<StreamMessageResponse>,
}

impl Inbound {
    async fn recv(&mut self) -> Option<StreamMessageResponse> {
        match self.requeued.pop_front() {
            Some(msg) => Some(msg),
            None => self.rx.recv().await,
        }
    }
}

/// Far end of an in-process session, standing in for the network stream.
#[cfg(test)]
pub(crate) struct SessionPeer {
    /// Messages the session wrote.
    pub outbound: mpsc::UnboundedReceiver<StreamMessageRequest>,
    /// Messages delivered to the session.
    pub inbound: mpsc::UnboundedSender<StreamMessageResponse>,
}

#[cfg(test)]
impl SessionPeer {
    /// Deliver a subscribe acknowledgement with the given status code.
    pub fn ack(&self, device_id: u32, code: i32) -> bool {
        let ack = proto::Subscribe {
            is_master: true,
            device_id,
            notifications: None,
            status: Some(proto::RpcStatus {
                code,
                message: String::new(),
                details: Vec::new(),
            }),
        };
        self.inbound
            .send(StreamMessageResponse {
                update: Some(Update::Subscribe(ack)),
            })
            .is_ok()
    }
}

pub struct StreamSession {
    client_id: u32,
    outbound: mpsc::UnboundedSender<StreamMessageRequest>,
    inbound: Mutex<Inbound>,
    state: watch::Sender<SubscribeState>,
    closed: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl StreamSession {
    /// Open the stream channel on `client` and start both tasks.
    pub fn open(client: BfRuntimeClient, client_id: u32) -> Self {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<StreamMessageRequest>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (wire_tx, wire_rx) = mpsc::channel::<StreamMessageRequest>(WIRE_BUFFER);
        let closed = Arc::new(AtomicBool::new(false));

        let send_task = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if wire_tx.send(msg).await.is_err() {
                    debug!("request stream dropped, stopping send task");
                    break;
                }
            }
        });

        let recv_closed = closed.clone();
        let recv_task = tokio::spawn(async move {
            let requests = futures_util::stream::unfold(wire_rx, |mut rx| async move {
                rx.recv().await.map(|msg| (msg, rx))
            });
            let mut client = client;
            match client.stream_channel(requests).await {
                Ok(response) => {
                    let mut stream = response.into_inner();
                    loop {
                        match stream.message().await {
                            Ok(Some(msg)) => {
                                if inbound_tx.send(msg).is_err() {
                                    break;
                                }
                            }
                            Ok(None) => {
                                debug!(client_id, "stream channel ended");
                                break;
                            }
                            Err(status) => {
                                warn!(client_id, error = %status, "stream channel failed");
                                break;
                            }
                        }
                    }
                }
                Err(status) => {
                    warn!(client_id, error = %status, "failed to open stream channel");
                }
            }
            recv_closed.store(true, Ordering::SeqCst);
        });

        Self::assemble(client_id, outbound_tx, inbound_rx, closed, vec![send_task, recv_task])
    }

    /// Session wired to in-process queues instead of a network stream.
    #[cfg(test)]
    pub(crate) fn with_queues(client_id: u32) -> (Self, SessionPeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let session = Self::assemble(
            client_id,
            outbound_tx,
            inbound_rx,
            Arc::new(AtomicBool::new(false)),
            Vec::new(),
        );
        let peer = SessionPeer {
            outbound: outbound_rx,
            inbound: inbound_tx,
        };
        (session, peer)
    }

    fn assemble(
        client_id: u32,
        outbound: mpsc::UnboundedSender<StreamMessageRequest>,
        rx: mpsc::UnboundedReceiver<StreamMessageResponse>,
        closed: Arc<AtomicBool>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        let (state, _) = watch::channel(SubscribeState::Pending);
        Self {
            client_id,
            outbound,
            inbound: Mutex::new(Inbound {
                rx,
                requeued: VecDeque::new(),
            }),
            state,
            closed,
            tasks,
        }
    }

    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    pub fn state(&self) -> SubscribeState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Subscribe to `device_id`.
    ///
    /// Writes a single subscribe request, then polls the inbound queue up
    /// to `opts.attempts` times, waiting at most `opts.timeout` each time.
    /// Messages that are not the acknowledgement are put back after every
    /// attempt so other consumers still see them.
    pub async fn subscribe(&self, device_id: u32, opts: &SubscribeOptions) -> Result<(), SessionError> {
        self.state.send_replace(SubscribeState::Pending);

        let request = StreamMessageRequest {
            client_id: self.client_id,
            update: Some(proto::stream_message_request::Update::Subscribe(proto::Subscribe {
                is_master: opts.is_master,
                device_id,
                notifications: Some(proto::subscribe::Notifications {
                    enable_learn_notifications: true,
                    enable_idletimeout_notifications: true,
                    enable_port_status_change_notifications: true,
                    enable_entry_active_notifications: false,
                }),
                status: None,
            })),
        };
        if self.outbound.send(request).is_err() {
            self.state.send_replace(SubscribeState::Failed);
            return Err(SessionError::Closed);
        }
        debug!(client_id = self.client_id, device_id, "subscribe request queued");

        let mut inbound = self.inbound.lock().await;
        for attempt in 1..=opts.attempts {
            let deadline = Instant::now() + opts.timeout;
            let mut stashed = Vec::new();
            let outcome = loop {
                match tokio::time::timeout_at(deadline, inbound.recv()).await {
                    Err(_) => break None,
                    Ok(None) => {
                        inbound.requeued.extend(stashed);
                        self.state.send_replace(SubscribeState::Failed);
                        return Err(SessionError::Closed);
                    }
                    Ok(Some(msg)) => match msg.update {
                        Some(Update::Subscribe(ref ack)) if ack.device_id == device_id => {
                            break Some(ack.clone());
                        }
                        _ => stashed.push(msg),
                    },
                }
            };
            inbound.requeued.extend(stashed);

            if let Some(ack) = outcome {
                let (code, message) = ack
                    .status
                    .map(|s| (s.code, s.message))
                    .unwrap_or_default();
                if code != 0 {
                    self.state.send_replace(SubscribeState::Failed);
                    warn!(device_id, code, %message, "subscribe rejected");
                    return Err(SessionError::SubscribeRejected {
                        device_id,
                        code: tonic::Code::from_i32(code),
                        message,
                    });
                }
                self.state.send_replace(SubscribeState::Acked);
                info!(client_id = self.client_id, device_id, attempt, "subscribed");
                return Ok(());
            }
            debug!(device_id, attempt, "no subscribe acknowledgement yet");
        }

        self.state.send_replace(SubscribeState::Failed);
        Err(SessionError::SubscribeTimeout {
            device_id,
            attempts: opts.attempts,
        })
    }

    /// Next inbound message (digest, port status, ...), waiting up to `wait`.
    pub async fn recv_notification(&self, wait: Duration) -> Option<StreamMessageResponse> {
        let mut inbound = self.inbound.lock().await;
        tokio::time::timeout(wait, inbound.recv()).await.ok().flatten()
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port_status() -> StreamMessageResponse {
        StreamMessageResponse {
            update: Some(Update::PortStatusChangeNotification(proto::PortStatusChgNotification {
                port_key: None,
                port_up: true,
            })),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_gives_up_after_all_attempts() {
        let (session, mut peer) = StreamSession::with_queues(1);
        let opts = SubscribeOptions {
            attempts: 3,
            timeout: Duration::from_millis(200),
            is_master: true,
        };

        let start = Instant::now();
        let err = session.subscribe(0, &opts).await.unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, SessionError::SubscribeTimeout { attempts: 3, .. }));
        assert!(elapsed >= Duration::from_millis(600));
        assert!(elapsed < Duration::from_millis(610));
        assert_eq!(session.state(), SubscribeState::Failed);

        // exactly one control message was written
        assert!(peer.outbound.try_recv().is_ok());
        assert!(peer.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscribe_acked() {
        let (session, peer) = StreamSession::with_queues(1);
        assert!(peer.ack(0, 0));
        session.subscribe(0, &SubscribeOptions::default()).await.unwrap();
        assert_eq!(session.state(), SubscribeState::Acked);
    }

    #[tokio::test]
    async fn test_subscribe_rejected_status() {
        let (session, peer) = StreamSession::with_queues(1);
        peer.ack(0, tonic::Code::PermissionDenied as i32);
        let err = session.subscribe(0, &SubscribeOptions::default()).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::SubscribeRejected { code: tonic::Code::PermissionDenied, .. }
        ));
        assert_eq!(session.state(), SubscribeState::Failed);
    }

    #[tokio::test]
    async fn test_unmatched_messages_are_requeued() {
        let (session, peer) = StreamSession::with_queues(1);
        peer.inbound.send(port_status()).unwrap();
        peer.ack(3, 0); // different device
        peer.ack(0, 0);

        session.subscribe(0, &SubscribeOptions::default()).await.unwrap();

        let first = session.recv_notification(Duration::from_millis(10)).await.unwrap();
        assert!(matches!(first.update, Some(Update::PortStatusChangeNotification(_))));
        let second = session.recv_notification(Duration::from_millis(10)).await.unwrap();
        assert!(matches!(second.update, Some(Update::Subscribe(ref s)) if s.device_id == 3));
        assert!(session.recv_notification(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_closed_stream_fails_fast() {
        let (session, peer) = StreamSession::with_queues(1);
        drop(peer);
        let err = session.subscribe(0, &SubscribeOptions::default()).await.unwrap_err();
        assert!(matches!(err, SessionError::Closed));
    }
}
