//! Reconnect-with-backoff wrapper around a [`Transport`].
//!
//! A [`ResilientChannel`] owns one background task that walks the state
//! machine
//!
//! ```text
//! unsupported            (capability absent, terminal)
//! disconnected -> connecting -> connected -> disconnected -> ...
//! ```
//!
//! Failed or dropped connections are retried after the current backoff,
//! which then doubles up to a ceiling and resets on every successful
//! connect. Every committed state change is published on a watch channel.

use crate::transport::{Connection, Transport};
use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unsupported,
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatus {
    pub state: ConnectionState,
    /// Delay before the next retry
    pub backoff: Duration,
    /// Successful connections so far
    pub connections: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// An attempt still pending after this long counts as failed
    pub connect_timeout: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(1000),
            max: Duration::from_millis(30_000),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Capped exponential backoff.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            current: policy.initial,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Doubles the delay, never past the ceiling.
    pub fn advance(&mut self) -> Duration {
        self.current = (self.current * 2).min(self.policy.max);
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.policy.initial;
    }
}

#[derive(Debug)]
enum Command {
    SetEndpoint(String),
    SetGreeting(Option<Vec<u8>>),
    Send(Vec<u8>),
    Close,
}

enum Interrupt {
    Continue,
    Restart,
    Stop,
}

struct Control {
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<ChannelStatus>,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    policy: BackoffPolicy,
    backoff: Backoff,
    endpoint: Option<String>,
    greeting: Option<Vec<u8>>,
    connections: u64,
    label: &'static str,
}

impl Control {
    fn publish(&self, state: ConnectionState) {
        self.status.send_replace(ChannelStatus {
            state,
            backoff: self.backoff.current(),
            connections: self.connections,
        });
    }

    /// Applies a command that arrived while no connection is usable.
    fn handle(&mut self, command: Option<Command>) -> Interrupt {
        match command {
            None | Some(Command::Close) => Interrupt::Stop,
            Some(Command::SetEndpoint(endpoint)) => {
                debug!("{}: endpoint set to {}", self.label, endpoint);
                self.endpoint = Some(endpoint);
                self.backoff.reset();
                Interrupt::Restart
            }
            Some(Command::SetGreeting(greeting)) => {
                self.greeting = greeting;
                Interrupt::Continue
            }
            Some(Command::Send(_)) => {
                debug!("{}: not connected, dropping outbound frame", self.label);
                Interrupt::Continue
            }
        }
    }
}

async fn drive<T: Transport>(transport: T, mut ctl: Control) {
    if !transport.is_supported() {
        warn!("{}: transport unsupported, not connecting", ctl.label);
        ctl.publish(ConnectionState::Unsupported);
        return;
    }

    'outer: loop {
        let Some(endpoint) = ctl.endpoint.clone() else {
            let command = ctl.commands.recv().await;
            match ctl.handle(command) {
                Interrupt::Stop => break,
                Interrupt::Continue | Interrupt::Restart => continue,
            }
        };

        ctl.publish(ConnectionState::Connecting);
        let attempt = tokio::time::timeout(ctl.policy.connect_timeout, transport.connect(&endpoint));
        tokio::pin!(attempt);

        let result = loop {
            tokio::select! {
                result = &mut attempt => break result,
                command = ctl.commands.recv() => match ctl.handle(command) {
                    Interrupt::Continue => {}
                    Interrupt::Restart => continue 'outer,
                    Interrupt::Stop => break 'outer,
                },
            }
        };

        match result {
            Ok(Ok(mut conn)) => {
                ctl.backoff.reset();
                ctl.connections += 1;
                ctl.publish(ConnectionState::Connected);
                info!("{}: connected to {}", ctl.label, endpoint);

                let mut outcome = Interrupt::Continue;
                if let Some(greeting) = ctl.greeting.clone() {
                    if let Err(e) = conn.send(greeting).await {
                        warn!("{}: greeting failed: {}", ctl.label, e);
                        outcome = Interrupt::Restart;
                    }
                }

                while matches!(outcome, Interrupt::Continue) {
                    tokio::select! {
                        frame = conn.recv() => match frame {
                            Some(Ok(bytes)) => {
                                let _ = ctl.inbound.send(bytes);
                            }
                            Some(Err(e)) => {
                                warn!("{}: connection error: {}", ctl.label, e);
                                outcome = Interrupt::Restart;
                            }
                            None => {
                                info!("{}: connection closed by remote", ctl.label);
                                outcome = Interrupt::Restart;
                            }
                        },
                        command = ctl.commands.recv() => match command {
                            Some(Command::Send(frame)) => {
                                if let Err(e) = conn.send(frame).await {
                                    warn!("{}: send failed: {}", ctl.label, e);
                                    outcome = Interrupt::Restart;
                                }
                            }
                            Some(Command::SetEndpoint(endpoint)) => {
                                ctl.endpoint = Some(endpoint);
                                ctl.backoff.reset();
                                conn.close().await;
                                continue 'outer;
                            }
                            other => {
                                if let Interrupt::Stop = ctl.handle(other) {
                                    outcome = Interrupt::Stop;
                                }
                            }
                        },
                    }
                }

                conn.close().await;
                if let Interrupt::Stop = outcome {
                    break 'outer;
                }
            }
            Ok(Err(e)) => warn!("{}: connect to {} failed: {}", ctl.label, endpoint, e),
            Err(_) => warn!("{}: connect to {} timed out", ctl.label, endpoint),
        }

        let delay = ctl.backoff.current();
        ctl.publish(ConnectionState::Disconnected);
        warn!("{}: retrying in {:?}", ctl.label, delay);

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                command = ctl.commands.recv() => match ctl.handle(command) {
                    Interrupt::Continue => {}
                    Interrupt::Restart => continue 'outer,
                    Interrupt::Stop => break 'outer,
                },
            }
        }
        ctl.backoff.advance();
    }

    ctl.publish(ConnectionState::Disconnected);
    debug!("{}: closed", ctl.label);
}

/// Handle to a self-healing connection. Dropping it closes the channel.
#[derive(Debug)]
pub struct ResilientChannel {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ChannelStatus>,
}

impl ResilientChannel {
    /// Starts the channel task. Nothing connects until an endpoint is set.
    /// Inbound frames arrive on the returned receiver.
    pub fn spawn<T: Transport>(
        label: &'static str,
        transport: T,
        policy: BackoffPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let backoff = Backoff::new(policy);
        let (status_tx, status_rx) = watch::channel(ChannelStatus {
            state: ConnectionState::Disconnected,
            backoff: backoff.current(),
            connections: 0,
        });
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(drive(
            transport,
            Control {
                commands: command_rx,
                status: status_tx,
                inbound: inbound_tx,
                policy,
                backoff,
                endpoint: None,
                greeting: None,
                connections: 0,
                label,
            },
        ));

        (
            Self {
                commands: command_tx,
                status: status_rx,
            },
            inbound_rx,
        )
    }

    /// Sets or resets the endpoint. Any attempt or connection in progress
    /// is abandoned and the backoff starts over.
    pub fn set_endpoint(&self, endpoint: impl Into<String>) {
        let _ = self.commands.send(Command::SetEndpoint(endpoint.into()));
    }

    /// Frame sent first on every successful connection.
    pub fn set_greeting(&self, greeting: Option<Vec<u8>>) {
        let _ = self.commands.send(Command::SetGreeting(greeting));
    }

    /// Best effort: frames submitted while not connected are dropped.
    pub fn send(&self, frame: Vec<u8>) {
        let _ = self.commands.send(Command::Send(frame));
    }

    pub fn status(&self) -> ChannelStatus {
        *self.status.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    /// Stops the channel for good. Safe to call repeatedly.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

impl Drop for ResilientChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::TransportError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Mode {
        Hang,
        Refuse,
        Accept,
    }

    /// Server side of an accepted mock connection
    pub struct MockPeer {
        pub to_client: mpsc::UnboundedSender<Vec<u8>>,
        pub from_client: mpsc::UnboundedReceiver<Vec<u8>>,
    }

    pub struct MockConnection {
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
    }

    impl Connection for MockConnection {
        async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
            self.outbound.send(frame).map_err(|_| TransportError::Closed)
        }

        async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
            self.inbound.recv().await.map(Ok)
        }

        async fn close(&mut self) {
            self.inbound.close();
        }
    }

    #[derive(Clone)]
    pub struct MockTransport {
        pub supported: bool,
        pub mode: Arc<Mutex<Mode>>,
        pub attempts: Arc<AtomicUsize>,
        pub endpoints: Arc<Mutex<Vec<String>>>,
        pub peers: mpsc::UnboundedSender<MockPeer>,
    }

    impl MockTransport {
        pub fn new(mode: Mode) -> (Self, mpsc::UnboundedReceiver<MockPeer>) {
            let (peers, accepted) = mpsc::unbounded_channel();
            (
                Self {
                    supported: true,
                    mode: Arc::new(Mutex::new(mode)),
                    attempts: Arc::new(AtomicUsize::new(0)),
                    endpoints: Arc::new(Mutex::new(Vec::new())),
                    peers,
                },
                accepted,
            )
        }

        pub fn set_mode(&self, mode: Mode) {
            *self.mode.lock().unwrap() = mode;
        }

        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl Transport for MockTransport {
        type Conn = MockConnection;

        fn is_supported(&self) -> bool {
            self.supported
        }

        async fn connect(&self, endpoint: &str) -> Result<MockConnection, TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.endpoints.lock().unwrap().push(endpoint.to_string());
            let mode = *self.mode.lock().unwrap();
            match mode {
                Mode::Hang => std::future::pending().await,
                Mode::Refuse => Err(TransportError::ConnectFailed("refused".to_string())),
                Mode::Accept => {
                    let (to_client, inbound) = mpsc::unbounded_channel();
                    let (outbound, from_client) = mpsc::unbounded_channel();
                    let _ = self.peers.send(MockPeer {
                        to_client,
                        from_client,
                    });
                    Ok(MockConnection { inbound, outbound })
                }
            }
        }
    }

    pub async fn next_status(
        status: &mut watch::Receiver<ChannelStatus>,
        state: ConnectionState,
    ) -> ChannelStatus {
        loop {
            status.changed().await.unwrap();
            let current = *status.borrow_and_update();
            if current.state == state {
                return current;
            }
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(BackoffPolicy::default());
        assert_eq!(backoff.current(), Duration::from_secs(1));

        let delays: Vec<u64> = (0..7).map(|_| backoff.advance().as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30, 30]);

        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_is_terminal() {
        let (mut transport, _peers) = MockTransport::new(Mode::Accept);
        transport.supported = false;
        let (channel, _inbound) = ResilientChannel::spawn("test", transport.clone(), BackoffPolicy::default());
        let mut status = channel.subscribe();

        channel.set_endpoint("ws://nowhere");
        next_status(&mut status, ConnectionState::Unsupported).await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(channel.state(), ConnectionState::Unsupported);
        assert_eq!(transport.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_handshake_backs_off_to_max() {
        let (transport, _peers) = MockTransport::new(Mode::Hang);
        let (channel, _inbound) = ResilientChannel::spawn("test", transport.clone(), BackoffPolicy::default());
        let mut status = channel.subscribe();
        channel.set_endpoint("ws://slow");

        let mut delays = Vec::new();
        for _ in 0..8 {
            let disconnected = next_status(&mut status, ConnectionState::Disconnected).await;
            delays.push(disconnected.backoff.as_secs());
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));

        channel.close();
        let attempts = transport.attempts();
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(transport.attempts(), attempts);
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_backoff() {
        let (transport, mut peers) = MockTransport::new(Mode::Refuse);
        let (channel, _inbound) = ResilientChannel::spawn("test", transport.clone(), BackoffPolicy::default());
        let mut status = channel.subscribe();
        channel.set_endpoint("ws://flaky");

        for expected in [1, 2, 4] {
            let disconnected = next_status(&mut status, ConnectionState::Disconnected).await;
            assert_eq!(disconnected.backoff.as_secs(), expected);
        }

        transport.set_mode(Mode::Accept);
        let connected = next_status(&mut status, ConnectionState::Connected).await;
        assert_eq!(connected.backoff, Duration::from_secs(1));
        assert_eq!(connected.connections, 1);

        let peer = peers.recv().await.unwrap();
        drop(peer);
        let disconnected = next_status(&mut status, ConnectionState::Disconnected).await;
        assert_eq!(disconnected.backoff, Duration::from_secs(1));

        let reconnected = next_status(&mut status, ConnectionState::Connected).await;
        assert_eq!(reconnected.connections, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_greeting_then_frames_both_ways() {
        let (transport, mut peers) = MockTransport::new(Mode::Accept);
        let (channel, mut inbound) = ResilientChannel::spawn("test", transport, BackoffPolicy::default());

        channel.send(vec![0]);
        channel.set_greeting(Some(b"hello".to_vec()));
        channel.set_endpoint("ws://ok");

        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.from_client.recv().await.unwrap(), b"hello".to_vec());

        channel.send(vec![1, 2, 3]);
        assert_eq!(peer.from_client.recv().await.unwrap(), vec![1, 2, 3]);

        peer.to_client.send(vec![9]).unwrap();
        assert_eq!(inbound.recv().await.unwrap(), vec![9]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_endpoint_change_restarts_attempt() {
        let (transport, _peers) = MockTransport::new(Mode::Hang);
        let (channel, _inbound) = ResilientChannel::spawn("test", transport.clone(), BackoffPolicy::default());

        channel.set_endpoint("ws://a");
        tokio::time::sleep(Duration::from_millis(100)).await;
        channel.set_endpoint("ws://b");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            *transport.endpoints.lock().unwrap(),
            vec!["ws://a".to_string(), "ws://b".to_string()]
        );
        assert_eq!(channel.state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_backoff_stops_retries() {
        let (transport, _peers) = MockTransport::new(Mode::Refuse);
        let (channel, _inbound) = ResilientChannel::spawn("test", transport.clone(), BackoffPolicy::default());
        let mut status = channel.subscribe();
        channel.set_endpoint("ws://down");

        next_status(&mut status, ConnectionState::Disconnected).await;
        channel.close();
        channel.close();
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(transport.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_closes_connection() {
        let (transport, mut peers) = MockTransport::new(Mode::Accept);
        let (channel, _inbound) = ResilientChannel::spawn("test", transport.clone(), BackoffPolicy::default());
        channel.set_endpoint("ws://ok");

        let mut peer = peers.recv().await.unwrap();
        drop(channel);

        assert!(peer.from_client.recv().await.is_none());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.attempts(), 1);
    }
}
