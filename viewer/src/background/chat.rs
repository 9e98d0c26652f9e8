//! The resilient chat channel: one socket at a time, opened only while the room is live, and
//! redialed with backoff when it drops.

use crate::background::{LivenessFact, TaskGuard, set_if_changed};
use crate::config::ReconnectPolicy;
use crate::error::{ProtocolError, TransportError};
use crate::live_api::{ChatConnection, ChatConnector, ChatMessage, OutgoingChatMessage};
use crate::machine::{ChannelCommand, ChannelMachine, ChatStatus, ConnectionState};
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// How long a hung-up socket gets to finish its close handshake before it is dropped.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// How long a dial may take, handshake included, before it counts as a failed attempt.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
enum ChatRequest {
    Send(String),
    Connect,
    Close,
}

/// The UI side of the chat channel.
///
/// History, status and connection state are exposed as watch channels, so a renderer can
/// await changes or just borrow the latest value.
#[derive(Debug, Clone)]
pub struct ChatHandle {
    requests: mpsc::UnboundedSender<ChatRequest>,
    history: watch::Receiver<Vec<ChatMessage>>,
    status: watch::Receiver<ChatStatus>,
    state: watch::Receiver<ConnectionState>,
}

impl ChatHandle {
    /// Sends `text` to the room.
    ///
    /// Dropped without a trace unless the channel is open at the time it is processed.
    /// Messages are never queued for a later connection.
    pub fn send(&self, text: impl Into<String>) {
        let _ = self.requests.send(ChatRequest::Send(text.into()));
    }

    /// Opens the channel if the room is live. A no-op while already connected.
    pub fn connect(&self) {
        let _ = self.requests.send(ChatRequest::Connect);
    }

    /// Closes the channel. It reopens when the room next goes live.
    pub fn close(&self) {
        let _ = self.requests.send(ChatRequest::Close);
    }

    pub fn history(&self) -> watch::Receiver<Vec<ChatMessage>> {
        self.history.clone()
    }

    pub fn status(&self) -> watch::Receiver<ChatStatus> {
        self.status.clone()
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

#[derive(Debug)]
enum SocketEvent {
    Opened,
    Frame(String),
    Failed,
    Closed,
}

/// The driver's end of a socket task.
#[derive(Debug)]
struct SocketLink {
    /// Tags every event the socket task reports.
    generation: u64,
    /// Encoded frames for the socket task to write. Dropping this hangs the socket up.
    outbound: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

/// Owns the chat channel's state and carries out what [`ChannelMachine`] asks for.
struct ChatDriver<C> {
    /// Shared with every socket task so each can dial on its own.
    connector: Arc<C>,
    /// Where the room's chat socket lives.
    url: Url,
    machine: ChannelMachine,
    /// Whether the last liveness fact we saw said the room is live.
    live: bool,
    /// Generation of the newest socket task. Events tagged with anything else are stale.
    generation: u64,
    /// The socket currently dialing or open, if any.
    socket: Option<SocketLink>,
    /// A hung-up socket that may still be finishing its close handshake.
    closing: Option<JoinHandle<()>>,
    /// When the pending reconnect is due.
    retry_at: Option<Instant>,
    /// Handed to each socket task for reporting back to the driver.
    events: mpsc::UnboundedSender<(u64, SocketEvent)>,
    /// Every message received since mount, oldest first.
    history: watch::Sender<Vec<ChatMessage>>,
    /// The user-visible status line.
    status: watch::Sender<ChatStatus>,
    state: watch::Sender<ConnectionState>,
}

/// Spawn the chat task for the room whose socket lives at `url`.
///
/// The channel follows `liveness`: it opens when the room goes live and closes when it goes
/// offline. Only changes to `is_live` matter; a new title leaves the socket alone.
pub fn spawn_chat_task<C: ChatConnector>(
    connector: C,
    url: Url,
    policy: ReconnectPolicy,
    mut liveness: watch::Receiver<Option<LivenessFact>>,
) -> (ChatHandle, TaskGuard) {
    let (requests_tx, mut requests) = mpsc::unbounded_channel();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (history_tx, history_rx) = watch::channel(Vec::new());
    let (status_tx, status_rx) = watch::channel(ChatStatus::Clear);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

    let handle = ChatHandle {
        requests: requests_tx,
        history: history_rx,
        status: status_rx,
        state: state_rx,
    };

    let mut driver = ChatDriver {
        connector: Arc::new(connector),
        url,
        machine: ChannelMachine::new(policy),
        live: false,
        generation: 0,
        socket: None,
        closing: None,
        retry_at: None,
        events: events_tx,
        history: history_tx,
        status: status_tx,
        state: state_tx,
    };

    let guard = TaskGuard::spawn("chat", async move {
        let live = is_live(&liveness.borrow_and_update());
        driver.on_liveness(live);

        loop {
            let retry_at = driver.retry_at;
            tokio::select! {
                changed = liveness.changed() => {
                    if changed.is_err() {
                        tracing::debug!("liveness publisher is gone - closing chat");
                        driver.on_liveness(false);
                        break;
                    }
                    let live = is_live(&liveness.borrow_and_update());
                    driver.on_liveness(live);
                }
                request = requests.recv() => match request {
                    Some(ChatRequest::Send(text)) => driver.send(text),
                    Some(ChatRequest::Connect) if driver.live => {
                        let commands = driver.machine.request_open();
                        driver.apply(commands);
                    }
                    Some(ChatRequest::Connect) => {
                        tracing::debug!("room is not live - not connecting chat");
                    }
                    Some(ChatRequest::Close) => {
                        let commands = driver.machine.request_close();
                        driver.apply(commands);
                    }
                    None => break,
                },
                Some((generation, event)) = events.recv() => driver.on_socket_event(generation, event),
                () = sleep_until(retry_at) => {
                    driver.retry_at = None;
                    let commands = driver.machine.on_retry_due();
                    driver.apply(commands);
                }
            }
        }
    });

    (handle, guard)
}

fn is_live(fact: &Option<LivenessFact>) -> bool {
    fact.as_ref().is_some_and(|f| f.is_live)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl<C: ChatConnector> ChatDriver<C> {
    fn on_liveness(&mut self, live: bool) {
        if live == self.live {
            return;
        }
        self.live = live;
        let commands = if live {
            tracing::info!(url = %self.url, "room went live - opening chat");
            self.machine.request_open()
        } else {
            tracing::info!("room is offline - closing chat");
            self.machine.request_close()
        };
        self.apply(commands);
    }

    fn apply(&mut self, commands: Vec<ChannelCommand>) {
        for command in commands {
            match command {
                ChannelCommand::Dial => self.dial(),
                ChannelCommand::ScheduleRetry(delay) => {
                    tracing::info!(
                        attempt = self.machine.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "scheduling chat reconnect"
                    );
                    self.retry_at = Some(Instant::now() + delay);
                }
                ChannelCommand::CancelRetry => self.retry_at = None,
                ChannelCommand::Hangup => self.hangup(),
            }
        }

        let status = self.machine.status();
        if set_if_changed(&self.status, status) && status == ChatStatus::Exhausted {
            tracing::error!(
                attempts = self.machine.attempts(),
                "giving up on chat: {status}"
            );
        }
        set_if_changed(&self.state, self.machine.state());
    }

    fn dial(&mut self) {
        self.hangup();
        if let Some(previous) = self.closing.take() {
            // never two sockets for the room at once
            previous.abort();
        }

        self.generation += 1;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_socket(
            Arc::clone(&self.connector),
            self.url.clone(),
            self.generation,
            outbound_rx,
            self.events.clone(),
        ));
        self.socket = Some(SocketLink {
            generation: self.generation,
            outbound: outbound_tx,
            task,
        });
    }

    fn hangup(&mut self) {
        if let Some(link) = self.socket.take() {
            tracing::debug!(generation = link.generation, "hanging up chat socket");
            if let Some(previous) = self.closing.replace(link.task) {
                previous.abort();
            }
            // dropping `link.outbound` tells the socket task to close
        }
    }

    fn send(&self, text: String) {
        if text.trim().is_empty() {
            return;
        }
        let Some(link) = self.socket.as_ref().filter(|_| self.machine.can_send()) else {
            tracing::debug!(state = ?self.machine.state(), "chat is not open - dropping message");
            return;
        };
        let frame = match serde_json::to_string(&OutgoingChatMessage::new(text)) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode chat message");
                return;
            }
        };
        if link.outbound.send(frame).is_err() {
            tracing::debug!("chat socket already closing - dropping message");
        }
    }

    fn on_socket_event(&mut self, generation: u64, event: SocketEvent) {
        if self.socket.as_ref().map(|link| link.generation) != Some(generation) {
            tracing::trace!(generation, ?event, "ignoring event from retired chat socket");
            return;
        }

        let commands = match event {
            SocketEvent::Opened => {
                tracing::info!(generation, "chat connected");
                self.machine.on_open()
            }
            SocketEvent::Frame(payload) => {
                match serde_json::from_str::<ChatMessage>(&payload) {
                    Ok(message) => self.history.send_modify(|history| history.push(message)),
                    Err(source) => {
                        let e = ProtocolError { payload, source };
                        tracing::warn!(error = %e, cause = %e.source, "dropping chat frame");
                    }
                }
                Vec::new()
            }
            SocketEvent::Failed => self.machine.on_error(),
            SocketEvent::Closed => {
                // the socket task is already on its way out
                self.socket = None;
                self.machine.on_close()
            }
        };
        self.apply(commands);
    }
}

async fn run_socket<C: ChatConnector>(
    connector: Arc<C>,
    url: Url,
    generation: u64,
    mut outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<(u64, SocketEvent)>,
) {
    let emit = |event| {
        // the driver only goes away when the whole channel does
        let _ = events.send((generation, event));
    };

    let dialed = tokio::select! {
        dialed = tokio::time::timeout(DIAL_TIMEOUT, connector.dial(&url)) => {
            dialed.unwrap_or_else(|_| {
                Err(TransportError::Timeout {
                    target: url.to_string(),
                    after: DIAL_TIMEOUT,
                })
            })
        }
        None = outbound.recv() => {
            tracing::trace!(generation, "hung up while dialing");
            return;
        }
    };
    let mut conn = match dialed {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(generation, error = %e, "failed to connect to chat");
            emit(SocketEvent::Failed);
            emit(SocketEvent::Closed);
            return;
        }
    };
    emit(SocketEvent::Opened);

    loop {
        tokio::select! {
            frame = conn.recv() => match frame {
                Some(Ok(payload)) => emit(SocketEvent::Frame(payload)),
                Some(Err(e)) => {
                    tracing::warn!(generation, error = %e, "chat socket failed");
                    emit(SocketEvent::Failed);
                    emit(SocketEvent::Closed);
                    return;
                }
                None => {
                    tracing::info!(generation, "chat socket closed by server");
                    emit(SocketEvent::Closed);
                    return;
                }
            },
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = conn.send(frame).await {
                        tracing::warn!(generation, error = %e, "failed to send chat message");
                        emit(SocketEvent::Failed);
                        emit(SocketEvent::Closed);
                        return;
                    }
                }
                None => {
                    if tokio::time::timeout(CLOSE_GRACE, conn.close()).await.is_err() {
                        tracing::debug!(generation, "chat close handshake timed out");
                    }
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::sync::oneshot;

    type Answer = oneshot::Sender<Option<FakeConnection>>;

    /// Hands every dial to the test, which decides whether it connects.
    struct FakeConnector {
        dials: mpsc::UnboundedSender<Answer>,
    }

    impl ChatConnector for FakeConnector {
        type Conn = FakeConnection;

        async fn dial(&self, _url: &Url) -> Result<FakeConnection, TransportError> {
            let (tx, rx) = oneshot::channel();
            let _ = self.dials.send(tx);
            match rx.await {
                Ok(Some(conn)) => Ok(conn),
                _ => Err(TransportError::InvalidUrl(String::from("connection refused"))),
            }
        }
    }

    struct FakeConnection {
        inbound: mpsc::UnboundedReceiver<String>,
        sent: mpsc::UnboundedSender<String>,
    }

    impl ChatConnection for FakeConnection {
        async fn recv(&mut self) -> Option<Result<String, TransportError>> {
            self.inbound.recv().await.map(Ok)
        }

        async fn send(&mut self, frame: String) -> Result<(), TransportError> {
            let _ = self.sent.send(frame);
            Ok(())
        }

        async fn close(self) {}
    }

    /// The server's end of an accepted fake connection. Dropping `push` closes the socket.
    struct Server {
        push: mpsc::UnboundedSender<String>,
        sent: mpsc::UnboundedReceiver<String>,
    }

    fn accept(answer: Answer) -> Server {
        let (push, inbound) = mpsc::unbounded_channel();
        let (sent_tx, sent) = mpsc::unbounded_channel();
        answer
            .send(Some(FakeConnection {
                inbound,
                sent: sent_tx,
            }))
            .ok()
            .unwrap();
        Server { push, sent }
    }

    fn refuse(answer: Answer) {
        answer.send(None).ok().unwrap();
    }

    struct Harness {
        handle: ChatHandle,
        _guard: TaskGuard,
        dials: mpsc::UnboundedReceiver<Answer>,
        liveness: watch::Sender<Option<LivenessFact>>,
    }

    fn harness() -> Harness {
        let (dials_tx, dials) = mpsc::unbounded_channel();
        let (liveness, liveness_rx) = watch::channel(None);
        let (handle, guard) = spawn_chat_task(
            FakeConnector { dials: dials_tx },
            Url::parse("ws://localhost/chat?room=jolsho").unwrap(),
            ReconnectPolicy::default(),
            liveness_rx,
        );
        Harness {
            handle,
            _guard: guard,
            dials,
            liveness,
        }
    }

    fn fact(is_live: bool, title: &str) -> Option<LivenessFact> {
        Some(LivenessFact {
            is_live,
            title: title.to_string(),
        })
    }

    async fn wait_state(handle: &ChatHandle, want: ConnectionState) {
        handle.state().wait_for(|s| *s == want).await.unwrap();
    }

    /// Lets every task run until nothing is left to do but wait on timers.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn only_connects_while_live() {
        let mut h = harness();
        h.handle.connect();
        h.liveness.send_replace(fact(false, ""));
        settle().await;
        assert!(h.dials.try_recv().is_err());
        assert_eq!(*h.handle.state().borrow(), ConnectionState::Idle);

        h.liveness.send_replace(fact(true, "Jam"));
        let answer = h.dials.recv().await.unwrap();
        assert_eq!(*h.handle.state().borrow(), ConnectionState::Connecting);
        let mut server = accept(answer);
        wait_state(&h.handle, ConnectionState::Open).await;

        // same liveness again, and a title change: neither touches the socket
        h.liveness.send_replace(fact(true, "Jam"));
        h.liveness.send_replace(fact(true, "Jam, part two"));
        h.handle.connect();
        settle().await;
        assert!(h.dials.try_recv().is_err());
        assert_eq!(*h.handle.state().borrow(), ConnectionState::Open);

        h.liveness.send_replace(fact(false, "Jam, part two"));
        wait_state(&h.handle, ConnectionState::Idle).await;
        // the connection was dropped on our side
        assert_eq!(server.sent.recv().await, None);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(h.dials.try_recv().is_err());
        assert_eq!(*h.handle.status().borrow(), ChatStatus::Clear);
    }

    #[tokio::test(start_paused = true)]
    async fn messages_flow_both_ways() {
        let mut h = harness();
        h.liveness.send_replace(fact(true, "Jam"));
        let mut server = accept(h.dials.recv().await.unwrap());
        wait_state(&h.handle, ConnectionState::Open).await;

        h.handle.send("hello there");
        h.handle.send("   ");
        let frame = server.sent.recv().await.unwrap();
        let frame: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(frame["text"], "hello there");
        assert!(frame["timestamp"].as_str().unwrap().contains(':'));
        settle().await;
        assert!(server.sent.try_recv().is_err(), "blank messages are not sent");

        let mut history = h.handle.history();
        server
            .push
            .send(r#"{"code":1,"timestamp":"9:5","text":"first"}"#.into())
            .unwrap();
        server.push.send("{not json".into()).unwrap();
        server.push.send(r#"{"code":1,"text":"second"}"#.into()).unwrap();
        let history = history.wait_for(|h| h.len() == 2).await.unwrap().clone();
        assert_eq!(
            history,
            vec![
                ChatMessage {
                    code: 1,
                    timestamp: "9:5".into(),
                    text: "first".into()
                },
                ChatMessage {
                    code: 1,
                    timestamp: String::new(),
                    text: "second".into()
                },
            ]
        );
        assert_eq!(*h.handle.state().borrow(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn send_while_connecting_is_dropped() {
        let mut h = harness();
        h.liveness.send_replace(fact(true, "Jam"));
        let answer = h.dials.recv().await.unwrap();
        h.handle.send("too early");
        settle().await;

        let mut server = accept(answer);
        wait_state(&h.handle, ConnectionState::Open).await;
        settle().await;
        assert!(server.sent.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_until_exhausted() {
        let mut h = harness();
        h.liveness.send_replace(fact(true, "Jam"));

        let expected = [
            ChatStatus::Reconnecting { attempt: 1 },
            ChatStatus::Reconnecting { attempt: 2 },
            ChatStatus::Reconnecting { attempt: 3 },
            ChatStatus::Reconnecting { attempt: 4 },
            ChatStatus::Reconnecting { attempt: 5 },
            ChatStatus::Exhausted,
        ];
        let mut dialed_at = Vec::new();
        let start = Instant::now();
        for want in expected {
            let answer = h.dials.recv().await.unwrap();
            dialed_at.push((Instant::now() - start).as_millis());
            refuse(answer);
            h.handle.status().wait_for(|s| *s == want).await.unwrap();
        }
        assert_eq!(dialed_at, vec![0, 1000, 3000, 7000, 15000, 25000]);
        assert_eq!(
            h.handle.status().borrow().to_string(),
            "Unable to reconnect. Please refresh."
        );

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(h.dials.try_recv().is_err());
        assert_eq!(*h.handle.state().borrow(), ConnectionState::Closed);
        assert_eq!(*h.handle.status().borrow(), ChatStatus::Exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_handshake_counts_as_failed_attempt() {
        let mut h = harness();
        h.liveness.send_replace(fact(true, "Jam"));
        let start = Instant::now();
        // the server accepts but never finishes the upgrade
        let _stalled = h.dials.recv().await.unwrap();
        assert_eq!(*h.handle.state().borrow(), ConnectionState::Connecting);

        h.handle
            .status()
            .wait_for(|s| *s == ChatStatus::Reconnecting { attempt: 1 })
            .await
            .unwrap();
        assert_eq!(Instant::now() - start, DIAL_TIMEOUT);

        let _server = accept(h.dials.recv().await.unwrap());
        assert_eq!(Instant::now() - start, DIAL_TIMEOUT + Duration::from_secs(1));
        wait_state(&h.handle, ConnectionState::Open).await;
        assert_eq!(*h.handle.status().borrow(), ChatStatus::Clear);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_open_restarts_backoff() {
        let mut h = harness();
        h.liveness.send_replace(fact(true, "Jam"));

        refuse(h.dials.recv().await.unwrap());
        let start = Instant::now();
        let server = accept(h.dials.recv().await.unwrap());
        assert_eq!((Instant::now() - start).as_millis(), 1000);
        wait_state(&h.handle, ConnectionState::Open).await;
        assert_eq!(*h.handle.status().borrow(), ChatStatus::Clear);

        // server goes away: the first retry after a success waits the base delay again
        drop(server);
        let start = Instant::now();
        let answer = h.dials.recv().await.unwrap();
        assert_eq!((Instant::now() - start).as_millis(), 1000);
        assert_eq!(
            *h.handle.status().borrow(),
            ChatStatus::Reconnecting { attempt: 1 }
        );
        drop(answer);
    }

    #[tokio::test(start_paused = true)]
    async fn going_offline_cancels_pending_retry() {
        let mut h = harness();
        h.liveness.send_replace(fact(true, "Jam"));
        refuse(h.dials.recv().await.unwrap());
        h.handle
            .status()
            .wait_for(|s| *s == ChatStatus::Reconnecting { attempt: 1 })
            .await
            .unwrap();

        h.liveness.send_replace(fact(false, "Jam"));
        wait_state(&h.handle, ConnectionState::Idle).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(h.dials.try_recv().is_err());
        assert_eq!(*h.handle.status().borrow(), ChatStatus::Clear);

        // coming back live dials right away
        h.liveness.send_replace(fact(true, "Jam"));
        let start = Instant::now();
        let _server = accept(h.dials.recv().await.unwrap());
        assert_eq!(Instant::now(), start);
        wait_state(&h.handle, ConnectionState::Open).await;
    }

    #[tokio::test]
    async fn talks_to_a_websocket_server() {
        use futures_util::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::Message;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (received_tx, mut received) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::text(r#"{"code":0,"timestamp":"12:0","text":"welcome"}"#))
                .await
                .unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Text(text) = message {
                    let _ = received_tx.send(text.as_str().to_owned());
                }
            }
        });

        let (liveness, liveness_rx) = watch::channel(fact(true, "Jam"));
        let (handle, _guard) = spawn_chat_task(
            crate::live_api::WsConnector::new(false).unwrap(),
            Url::parse(&format!("ws://{addr}/chat?room=jolsho")).unwrap(),
            ReconnectPolicy::default(),
            liveness_rx,
        );

        let history = handle
            .history()
            .wait_for(|h| !h.is_empty())
            .await
            .unwrap()
            .clone();
        assert_eq!(history[0].text, "welcome");
        wait_state(&handle, ConnectionState::Open).await;

        handle.send("hi from the viewer");
        let frame: serde_json::Value = serde_json::from_str(&received.recv().await.unwrap()).unwrap();
        assert_eq!(frame["text"], "hi from the viewer");

        // going offline closes the socket, which ends the server's read loop
        liveness.send_replace(fact(false, "Jam"));
        assert_eq!(received.recv().await, None);
        wait_state(&handle, ConnectionState::Idle).await;
    }
}
