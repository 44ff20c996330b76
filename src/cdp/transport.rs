use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::error::CdpError;
use super::types::{CdpCommand, CdpEvent, MessageKind, RawCdpMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Key for the subscriber map: (`method_name`, `session_id`).
type SubscriberKey = (String, Option<String>);

/// Command sent from a client handle to the transport task.
pub enum TransportCommand {
    /// Send a CDP command and deliver the response via the oneshot channel.
    SendCommand {
        command: CdpCommand,
        response_tx: oneshot::Sender<Result<serde_json::Value, CdpError>>,
        deadline: Instant,
    },
    /// Subscribe to events matching a method name (and optional session).
    Subscribe {
        method: String,
        session_id: Option<String>,
        event_tx: mpsc::Sender<CdpEvent>,
    },
    /// Drop every subscriber registered for a session. Their receivers
    /// observe channel closure.
    UnsubscribeSession { session_id: String },
    /// Shut down the transport gracefully.
    Shutdown,
}

/// Tracks an in-flight command awaiting its response.
struct PendingRequest {
    response_tx: oneshot::Sender<Result<serde_json::Value, CdpError>>,
    method: String,
    deadline: Instant,
}

/// Clonable handle for communicating with the transport task.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    command_tx: mpsc::Sender<TransportCommand>,
    connected: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
}

impl TransportHandle {
    /// Send a transport command to the background task.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Internal` if the transport task has exited.
    pub async fn send(&self, cmd: TransportCommand) -> Result<(), CdpError> {
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| CdpError::Internal("transport task is not running".into()))
    }

    /// Check whether the transport is currently connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Generate the next unique message ID for this connection.
    pub fn next_message_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Spawn the transport background task for one browser connection.
///
/// The task owns the WebSocket. There is no reconnection at this layer: a
/// closed or poisoned socket fails every pending command with
/// `TransportGone`/`Poisoned` and drops every subscriber, and the task
/// exits. Reconnection policy belongs to the connection orchestrator.
///
/// # Errors
///
/// Returns `CdpError::Connection` or `CdpError::ConnectionTimeout` if the
/// initial WebSocket connection cannot be established.
pub async fn spawn_transport(
    url: &str,
    channel_capacity: usize,
    connect_timeout: Duration,
) -> Result<TransportHandle, CdpError> {
    let ws_stream = connect_ws(url, connect_timeout).await?;
    let connected = Arc::new(AtomicBool::new(true));
    let next_id = Arc::new(AtomicU64::new(1));
    let (command_tx, command_rx) = mpsc::channel(channel_capacity);

    let handle = TransportHandle {
        command_tx,
        connected: Arc::clone(&connected),
        next_id,
    };

    tokio::spawn(async move {
        let mut task = TransportTask {
            ws_stream,
            command_rx,
            pending: HashMap::new(),
            subscribers: HashMap::new(),
            connected,
        };
        task.run().await;
    });

    Ok(handle)
}

/// Establish a WebSocket connection with a timeout.
async fn connect_ws(url: &str, timeout: Duration) -> Result<WsStream, CdpError> {
    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url)).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(CdpError::Connection(e.to_string())),
        Err(_) => Err(CdpError::ConnectionTimeout),
    }
}

/// The background task that owns the WebSocket connection.
struct TransportTask {
    ws_stream: WsStream,
    command_rx: mpsc::Receiver<TransportCommand>,
    pending: HashMap<u64, PendingRequest>,
    subscribers: HashMap<SubscriberKey, Vec<mpsc::Sender<CdpEvent>>>,
    connected: Arc<AtomicBool>,
}

/// What a single iteration of the run loop decided.
enum LoopStep {
    Continue,
    /// Terminate with the given error applied to all pending commands.
    Fail(CdpError),
    /// Clean shutdown requested.
    Shutdown,
}

impl TransportTask {
    async fn run(&mut self) {
        loop {
            let next_deadline = self.earliest_deadline();
            let timeout_sleep = async {
                match next_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    // No pending commands; park until a select branch wakes us.
                    None => std::future::pending::<()>().await,
                }
            };

            let step = tokio::select! {
                ws_msg = self.ws_stream.next() => self.handle_ws_message(ws_msg),

                cmd = self.command_rx.recv() => match cmd {
                    Some(TransportCommand::SendCommand { command, response_tx, deadline }) => {
                        self.handle_send_command(command, response_tx, deadline).await;
                        LoopStep::Continue
                    }
                    Some(TransportCommand::Subscribe { method, session_id, event_tx }) => {
                        self.subscribers
                            .entry((method, session_id))
                            .or_default()
                            .push(event_tx);
                        LoopStep::Continue
                    }
                    Some(TransportCommand::UnsubscribeSession { session_id }) => {
                        let sid = Some(session_id);
                        self.subscribers.retain(|(_, s), _| *s != sid);
                        LoopStep::Continue
                    }
                    Some(TransportCommand::Shutdown) | None => LoopStep::Shutdown,
                },

                () = timeout_sleep => {
                    self.sweep_timeouts();
                    LoopStep::Continue
                }
            };

            match step {
                LoopStep::Continue => {}
                LoopStep::Fail(err) => {
                    self.teardown(&err).await;
                    return;
                }
                LoopStep::Shutdown => {
                    self.teardown(&CdpError::TransportGone).await;
                    return;
                }
            }
        }
    }

    fn handle_ws_message(
        &mut self,
        ws_msg: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    ) -> LoopStep {
        match ws_msg {
            Some(Ok(Message::Text(text))) => {
                let Ok(raw) = serde_json::from_str::<RawCdpMessage>(&text) else {
                    // Unparseable frame: the channel can no longer be
                    // trusted for id correlation. Poison and close.
                    return LoopStep::Fail(CdpError::Poisoned(
                        "received a frame that is not valid CDP JSON".into(),
                    ));
                };
                match raw.classify() {
                    Some(MessageKind::Response(response)) => {
                        if let Some(pending) = self.pending.remove(&response.id) {
                            let result = match response.result {
                                Ok(value) => Ok(value),
                                Err(proto_err) => Err(CdpError::Protocol {
                                    code: proto_err.code,
                                    message: proto_err.message,
                                }),
                            };
                            let _ = pending.response_tx.send(result);
                        }
                        // An unknown id is an out-of-order reply to a command
                        // whose caller already timed out; drop it.
                    }
                    Some(MessageKind::Event(event)) => self.dispatch_event(&event),
                    None => {
                        return LoopStep::Fail(CdpError::Poisoned(
                            "received a frame with neither id nor method".into(),
                        ));
                    }
                }
                LoopStep::Continue
            }
            Some(Ok(Message::Close(_)) | Err(_)) | None => LoopStep::Fail(CdpError::TransportGone),
            Some(Ok(_)) => LoopStep::Continue, // Binary, Ping, Pong, Frame
        }
    }

    fn dispatch_event(&mut self, event: &CdpEvent) {
        let key = (event.method.clone(), event.session_id.clone());
        if let Some(senders) = self.subscribers.get_mut(&key) {
            senders.retain(|tx| tx.try_send(event.clone()).is_ok() || !tx.is_closed());
            if senders.is_empty() {
                self.subscribers.remove(&key);
            }
        }
    }

    async fn handle_send_command(
        &mut self,
        command: CdpCommand,
        response_tx: oneshot::Sender<Result<serde_json::Value, CdpError>>,
        deadline: Instant,
    ) {
        let id = command.id;
        let method = command.method.clone();

        let json = match serde_json::to_string(&command) {
            Ok(j) => j,
            Err(e) => {
                let _ =
                    response_tx.send(Err(CdpError::Internal(format!("serialization error: {e}"))));
                return;
            }
        };

        if let Err(e) = self.ws_stream.send(Message::Text(json.into())).await {
            let _ = response_tx.send(Err(CdpError::Connection(format!(
                "WebSocket write error: {e}"
            ))));
            return;
        }

        self.pending.insert(
            id,
            PendingRequest {
                response_tx,
                method,
                deadline,
            },
        );
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    fn sweep_timeouts(&mut self) {
        let now = Instant::now();
        let timed_out: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(&id, _)| id)
            .collect();

        for id in timed_out {
            if let Some(pending) = self.pending.remove(&id) {
                let _ = pending.response_tx.send(Err(CdpError::CommandTimeout {
                    method: pending.method,
                }));
            }
        }
    }

    /// Fail all pending commands with `err`, drop all subscribers (their
    /// receivers see closure), close the socket, and mark disconnected.
    async fn teardown(&mut self, err: &CdpError) {
        self.connected.store(false, Ordering::Relaxed);
        let pending = std::mem::take(&mut self.pending);
        for (_, req) in pending {
            let _ = req.response_tx.send(Err(err.clone()));
        }
        self.subscribers.clear();
        let _ = self.ws_stream.close(None).await;
    }
}
