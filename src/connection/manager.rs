use super::protocol::{parse_inbound, InboundEvent, OutboundEvent};
use super::{ConnectError, ConnectionState, Session, SocketError, StateHandle};
use crate::audio::FrameSink;
use crate::config::ClientConfig;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Upper bound on the closing handshake of a finished link
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Budget for socket open plus the `ready` event
    pub handshake_timeout: Duration,
    /// Fixed wait before every reconnection attempt
    pub reconnect_delay: Duration,
    /// Idle period after which the writer sends `ping`
    pub keepalive: Option<Duration>,
}

impl ConnectionOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout(),
            reconnect_delay: config.reconnect_delay(),
            keepalive: config.keepalive_interval(),
        }
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

/// Transport-level changes reported alongside inbound events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionNotice {
    /// The socket dropped unexpectedly; reconnection is under way
    Lost(SocketError),
    /// A new connection generation is live
    Reconnected(Session),
}

/// Receives inbound events in arrival order.
///
/// Called synchronously from the reader task; implementations must not block.
pub trait InboundHandler: Send + Sync {
    fn on_event(&self, event: InboundEvent);
    fn on_notice(&self, notice: ConnectionNotice);
}

/// One live socket with its generation's outbound queue
struct Link {
    sink: WsSink,
    source: WsSource,
    outbound_rx: mpsc::UnboundedReceiver<OutboundEvent>,
}

enum LinkEnd {
    Cancelled,
    Lost(SocketError),
}

struct Shared {
    options: ConnectionOptions,
    handler: Arc<dyn InboundHandler>,
    state: StateHandle,
    session: Mutex<Option<Session>>,
    /// Sender for the current generation; `None` while not connected.
    /// State changes that race with `close` happen under this lock.
    outbound: Mutex<Option<mpsc::UnboundedSender<OutboundEvent>>>,
    cancel: Mutex<CancellationToken>,
}

impl Shared {
    /// Set `state` unless the connection was closed deliberately
    fn transition(&self, cancel: &CancellationToken, state: ConnectionState) -> bool {
        let _guard = self.outbound.lock();
        if cancel.is_cancelled() {
            return false;
        }
        self.state.set(state);
        true
    }

    /// Install a fresh generation and announce `ready`
    fn go_live(&self, session: Session, ws: WsStream, cancel: &CancellationToken) -> Option<Link> {
        let (sink, source) = ws.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        {
            let mut outbound = self.outbound.lock();
            if cancel.is_cancelled() {
                return None;
            }
            *outbound = Some(outbound_tx);
            *self.session.lock() = Some(session.clone());
            self.state.set(ConnectionState::Connected);
        }

        info!("Session {} ready", session.session_id);
        self.handler.on_event(InboundEvent::Ready {
            session_id: session.session_id,
            conversation_id: session.conversation_id,
        });

        Some(Link {
            sink,
            source,
            outbound_rx,
        })
    }

    /// Forget the current generation; anything still queued is discarded
    fn drop_link(&self) {
        self.outbound.lock().take();
        self.session.lock().take();
    }

    fn dispatch(&self, text: &str) {
        match parse_inbound(text) {
            Ok(Some(InboundEvent::Pong)) => debug!("Keepalive acknowledged"),
            Ok(Some(event)) => {
                debug!("Received {}", event.kind());
                self.handler.on_event(event);
            }
            Ok(None) => {}
            Err(e) => warn!("Dropping malformed message: {}", e),
        }
    }
}

/// Owns the socket, the writer task and the reconnect supervisor
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(options: ConnectionOptions, handler: Arc<dyn InboundHandler>) -> Self {
        Self {
            shared: Arc::new(Shared {
                options,
                handler,
                state: StateHandle::default(),
                session: Mutex::new(None),
                outbound: Mutex::new(None),
                cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Open the socket and wait for the service's `ready`.
    ///
    /// The `ready` event is delivered to the handler before this returns.
    /// Later drops are handled by a background supervisor until [`close`].
    ///
    /// [`close`]: ConnectionManager::close
    pub async fn connect(&self, endpoint: &str) -> Result<Session, ConnectError> {
        let cancel = CancellationToken::new();
        {
            let mut current = self.shared.cancel.lock();
            current.cancel();
            *current = cancel.clone();
        }
        self.shared.transition(&cancel, ConnectionState::Connecting);
        info!("Connecting to {}", endpoint);

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ConnectError::Cancelled),
            result = establish(endpoint, self.shared.options.handshake_timeout) => result,
        };

        let (session, ws) = match result {
            Ok(established) => established,
            Err(e) => {
                warn!("Connection to {} failed: {}", endpoint, e);
                self.shared.transition(&cancel, ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let link = self
            .shared
            .go_live(session.clone(), ws, &cancel)
            .ok_or(ConnectError::Cancelled)?;

        tokio::spawn(supervise(
            Arc::clone(&self.shared),
            endpoint.to_string(),
            link,
            cancel,
        ));

        Ok(session)
    }

    /// Queue an event on the current connection; dropped when not connected
    pub fn send(&self, event: OutboundEvent) -> bool {
        match self.shared.outbound.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => {
                debug!("Not connected, dropping outbound event");
                false
            }
        }
    }

    /// Deliberate close; cancels any reconnection in flight
    pub fn close(&self) {
        self.shared.cancel.lock().cancel();

        let mut outbound = self.shared.outbound.lock();
        let was_live = outbound.take().is_some();
        self.shared.session.lock().take();
        self.shared.state.set(ConnectionState::Closed);
        drop(outbound);

        if was_live {
            info!("Connection closed");
        }
    }

    pub fn state(&self) -> StateHandle {
        self.shared.state.clone()
    }

    pub fn session(&self) -> Option<Session> {
        self.shared.session.lock().clone()
    }
}

impl FrameSink for ConnectionManager {
    fn is_connected(&self) -> bool {
        self.shared.state.is_connected()
    }

    fn send_audio(&self, data: String) {
        self.send(OutboundEvent::Audio { data });
    }
}

async fn establish(endpoint: &str, handshake: Duration) -> Result<(Session, WsStream), ConnectError> {
    let attempt = async {
        let (mut ws, _) = connect_async(endpoint).await.map_err(map_connect_error)?;
        let session = await_ready(&mut ws).await?;
        Ok::<_, ConnectError>((session, ws))
    };

    timeout(handshake, attempt)
        .await
        .map_err(|_| ConnectError::HandshakeTimeout(handshake.as_millis() as u64))?
}

fn map_connect_error(e: tungstenite::Error) -> ConnectError {
    match e {
        tungstenite::Error::Url(e) => ConnectError::InvalidEndpoint(e.to_string()),
        other => ConnectError::Transport(other.to_string()),
    }
}

async fn await_ready(ws: &mut WsStream) -> Result<Session, ConnectError> {
    while let Some(frame) = ws.next().await {
        match frame.map_err(|e| ConnectError::Transport(e.to_string()))? {
            Message::Text(text) => match parse_inbound(&text) {
                Ok(Some(InboundEvent::Ready {
                    session_id,
                    conversation_id,
                })) => return Ok(Session::new(session_id, conversation_id)),
                Ok(Some(InboundEvent::Error { message, .. })) => {
                    return Err(ConnectError::Rejected(message))
                }
                Ok(Some(other)) => debug!("Ignoring {} before ready", other.kind()),
                Ok(None) => {}
                Err(e) => warn!("Malformed message during handshake: {}", e),
            },
            Message::Close(_) => return Err(ConnectError::ClosedDuringHandshake),
            _ => {}
        }
    }
    Err(ConnectError::ClosedDuringHandshake)
}

/// Runs links until a deliberate close, reconnecting after every drop
async fn supervise(shared: Arc<Shared>, endpoint: String, first: Link, cancel: CancellationToken) {
    let mut link = first;

    loop {
        let end = run_link(&shared, link, &cancel).await;
        shared.drop_link();

        let err = match end {
            LinkEnd::Cancelled => break,
            LinkEnd::Lost(err) => err,
        };
        if !shared.transition(&cancel, ConnectionState::Reconnecting) {
            break;
        }
        warn!("Connection lost: {}", err);
        shared.handler.on_notice(ConnectionNotice::Lost(err));

        match reconnect(&shared, &endpoint, &cancel).await {
            Some(next) => link = next,
            None => break,
        }
    }

    debug!("Connection supervisor exiting");
}

async fn reconnect(shared: &Shared, endpoint: &str, cancel: &CancellationToken) -> Option<Link> {
    let delay = shared.options.reconnect_delay;
    let mut attempt: u32 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = sleep(delay) => {}
        }
        attempt += 1;
        info!("Reconnecting to {} (attempt {})", endpoint, attempt);

        let result = tokio::select! {
            _ = cancel.cancelled() => return None,
            result = establish(endpoint, shared.options.handshake_timeout) => result,
        };

        match result {
            Ok((session, ws)) => {
                shared
                    .handler
                    .on_notice(ConnectionNotice::Reconnected(session.clone()));
                return shared.go_live(session, ws, cancel);
            }
            Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
        }
    }
}

/// Read frames until the link ends; the writer runs alongside
async fn run_link(shared: &Shared, link: Link, cancel: &CancellationToken) -> LinkEnd {
    let Link {
        sink,
        mut source,
        outbound_rx,
    } = link;

    let link_token = cancel.child_token();
    let writer = tokio::spawn(write_loop(
        sink,
        outbound_rx,
        shared.options.keepalive,
        link_token.clone(),
    ));

    let end = loop {
        tokio::select! {
            _ = link_token.cancelled() => {
                break if cancel.is_cancelled() {
                    LinkEnd::Cancelled
                } else {
                    LinkEnd::Lost(SocketError::Send("writer stopped".into()))
                };
            }
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => shared.dispatch(&text),
                Some(Ok(Message::Binary(_))) => debug!("Ignoring binary frame"),
                Some(Ok(Message::Close(frame))) => {
                    debug!("Peer closed the connection: {:?}", frame);
                    break LinkEnd::Lost(SocketError::Closed);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break LinkEnd::Lost(SocketError::Transport(e.to_string())),
                None => break LinkEnd::Lost(SocketError::Closed),
            }
        }
    };

    link_token.cancel();
    if let Err(e) = writer.await {
        error!("Writer task failed: {}", e);
    }
    end
}

/// Sole owner of the sink; frames go out in queue order
async fn write_loop(
    mut sink: WsSink,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundEvent>,
    keepalive: Option<Duration>,
    token: CancellationToken,
) {
    let period = keepalive.unwrap_or(Duration::from_secs(3600));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = outbound_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = ticker.tick(), if keepalive.is_some() => OutboundEvent::Ping,
        };

        let text = match event.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("Dropping outbound event: {}", e);
                continue;
            }
        };

        if let Err(e) = sink.send(Message::Text(text)).await {
            warn!("Send failed: {}", e);
            token.cancel();
            return;
        }
        ticker.reset();
    }

    if timeout(CLOSE_TIMEOUT, sink.close()).await.is_err() {
        debug!("Closing handshake timed out");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[derive(Default)]
    struct RecordingHandler {
        events: Mutex<Vec<InboundEvent>>,
        notices: Mutex<Vec<ConnectionNotice>>,
    }

    impl InboundHandler for RecordingHandler {
        fn on_event(&self, event: InboundEvent) {
            self.events.lock().push(event);
        }

        fn on_notice(&self, notice: ConnectionNotice) {
            self.notices.lock().push(notice);
        }
    }

    fn options() -> ConnectionOptions {
        ConnectionOptions {
            handshake_timeout: Duration::from_millis(500),
            reconnect_delay: Duration::from_millis(50),
            keepalive: None,
        }
    }

    async fn server() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (stream, _) = listener.accept().await.unwrap();
        accept_async(stream).await.unwrap()
    }

    fn ready(id: &str) -> Message {
        Message::Text(format!(r#"{{"type":"ready","session_id":"{}","conversation_id":"c"}}"#, id))
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (listener, url) = server().await;
        tokio::spawn(async move {
            let _ws = accept(&listener).await;
            sleep(Duration::from_secs(2)).await;
        });

        let handler = Arc::new(RecordingHandler::default());
        let manager = ConnectionManager::new(
            ConnectionOptions {
                handshake_timeout: Duration::from_millis(200),
                ..options()
            },
            handler,
        );
        assert_eq!(manager.connect(&url).await, Err(ConnectError::HandshakeTimeout(200)));
        assert_eq!(manager.state().get(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let (listener, url) = server().await;
        drop(listener);

        let manager = ConnectionManager::new(options(), Arc::new(RecordingHandler::default()));
        assert!(matches!(manager.connect(&url).await, Err(ConnectError::Transport(_))));
    }

    #[tokio::test]
    async fn test_error_before_ready_is_rejected() {
        let (listener, url) = server().await;
        tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            ws.send(Message::Text(r#"{"type":"error","message":"no capacity"}"#.into()))
                .await
                .unwrap();
            sleep(Duration::from_millis(500)).await;
        });

        let manager = ConnectionManager::new(options(), Arc::new(RecordingHandler::default()));
        assert_eq!(
            manager.connect(&url).await,
            Err(ConnectError::Rejected("no capacity".into()))
        );
    }

    #[tokio::test]
    async fn test_dispatch_and_send() {
        let (listener, url) = server().await;
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            ws.send(ready("s1")).await.unwrap();
            ws.send(Message::Text("{broken".into())).await.unwrap();
            ws.send(Message::Text(r#"{"type":"mystery"}"#.into())).await.unwrap();
            ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
            ws.send(Message::Text(r#"{"type":"transcript","text":"hi"}"#.into()))
                .await
                .unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    let _ = seen_tx.send(text);
                }
            }
        });

        let handler = Arc::new(RecordingHandler::default());
        let manager = ConnectionManager::new(options(), handler.clone());
        let session = manager.connect(&url).await.unwrap();
        assert_eq!(session.session_id, "s1");
        assert!(manager.is_connected());

        assert!(wait_for(|| handler.events.lock().len() == 2).await);
        assert_eq!(
            handler.events.lock()[1],
            InboundEvent::Transcript { text: "hi".into() }
        );

        manager.send(OutboundEvent::Interrupt);
        manager.send_audio("AAAA".into());
        let first = timeout(Duration::from_secs(2), seen_rx.recv()).await.unwrap();
        let second = timeout(Duration::from_secs(2), seen_rx.recv()).await.unwrap();
        assert_eq!(first.as_deref(), Some(r#"{"type":"interrupt"}"#));
        assert_eq!(second.as_deref(), Some(r#"{"type":"audio","data":"AAAA"}"#));

        manager.close();
        assert_eq!(manager.state().get(), ConnectionState::Closed);
        assert!(!manager.send(OutboundEvent::Interrupt));
    }

    #[tokio::test]
    async fn test_reconnects_after_drop() {
        let (listener, url) = server().await;
        tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            ws.send(ready("first")).await.unwrap();
            ws.close(None).await.unwrap();

            let mut ws = accept(&listener).await;
            ws.send(ready("second")).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let handler = Arc::new(RecordingHandler::default());
        let manager = ConnectionManager::new(options(), handler.clone());
        manager.connect(&url).await.unwrap();

        assert!(wait_for(|| handler.events.lock().len() == 2).await);
        assert!(wait_for(|| manager.is_connected()).await);
        assert_eq!(manager.session().map(|s| s.session_id), Some("second".into()));

        let notices = handler.notices.lock().clone();
        assert!(matches!(notices[0], ConnectionNotice::Lost(_)));
        assert!(matches!(&notices[1], ConnectionNotice::Reconnected(s) if s.session_id == "second"));

        manager.close();
    }

    #[tokio::test]
    async fn test_close_cancels_reconnection() {
        let (listener, url) = server().await;
        let (accepted_tx, mut accepted_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            ws.send(ready("only")).await.unwrap();
            ws.close(None).await.unwrap();
            drop(ws);
            // Any further attempt would land here
            if listener.accept().await.is_ok() {
                let _ = accepted_tx.send(());
            }
        });

        let handler = Arc::new(RecordingHandler::default());
        let manager = ConnectionManager::new(
            ConnectionOptions {
                reconnect_delay: Duration::from_millis(300),
                ..options()
            },
            handler.clone(),
        );
        manager.connect(&url).await.unwrap();

        assert!(wait_for(|| manager.state().get() == ConnectionState::Reconnecting).await);
        manager.close();

        assert!(timeout(Duration::from_millis(600), accepted_rx.recv()).await.is_err());
        assert_eq!(manager.state().get(), ConnectionState::Closed);
    }
}
