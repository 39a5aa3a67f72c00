//! Client session
//!
//! Peer-side mirror of a broker connection. [`Client::connect`] performs the
//! CONN/CONN_ACK handshake, then a background task owns the socket: it
//! writes queued frames and turns inbound frames into [`Delivery`] values.

mod command;

pub use command::{Command, CommandError};

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::codec::{read_frame, write_frame, FrameBuf, ReadOutcome};
use crate::protocol::{Frame, Request, FRAME_SIZE};
use crate::session::{expect_request, ConnectionError, RetryPolicy, SessionStatus, SessionTracker};

/// Something the broker sent to this client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// A published message; `retained` is set for PUBRET frames
    Message {
        topic: String,
        message: String,
        retained: bool,
    },
    /// Reply to LIST
    Subscriptions(Vec<String>),
    /// Any other frame, as its request text
    Notice(String),
}

/// Client session options
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    /// Budget for receiving CONN_ACK
    pub connect: RetryPolicy,
    /// Budget for receiving DISC_ACK
    pub disconnect: RetryPolicy,
    /// Capacity of the outbound and delivery queues
    pub channel_capacity: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect: RetryPolicy::default(),
            disconnect: RetryPolicy::default(),
            channel_capacity: 64,
        }
    }
}

/// A connected client session
pub struct Client {
    peer: SocketAddr,
    outbound: mpsc::Sender<Frame>,
    session: Arc<SessionTracker>,
    disconnect_policy: RetryPolicy,
    task: Option<JoinHandle<()>>,
}

impl Client {
    /// Connect with default options
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
    ) -> Result<(Self, mpsc::Receiver<Delivery>), ConnectionError> {
        Self::connect_with(addr, ClientOptions::default()).await
    }

    /// Open the transport and run the CONN/CONN_ACK handshake
    ///
    /// Returns the session and the stream of deliveries. The delivery
    /// stream ends once the session is over.
    pub async fn connect_with<A: ToSocketAddrs>(
        addr: A,
        options: ClientOptions,
    ) -> Result<(Self, mpsc::Receiver<Delivery>), ConnectionError> {
        let mut stream = TcpStream::connect(addr).await?;
        let peer = stream.peer_addr()?;
        debug!("Connected to {}, sending CONN", peer);

        let mut buf = [0u8; FRAME_SIZE];
        write_frame(&mut stream, &Frame::control(Request::Conn)).await?;
        expect_request(&mut stream, &mut buf, Request::ConnAck, options.connect).await?;

        let session = Arc::new(SessionTracker::new());
        session.mark_connected();

        let (outbound, outbound_rx) = mpsc::channel(options.channel_capacity);
        let (deliveries, deliveries_rx) = mpsc::channel(options.channel_capacity);
        let listener = Listener {
            stream,
            read_buf: buf,
            outbound: outbound_rx,
            deliveries,
            session: session.clone(),
        };
        let task = tokio::spawn(listener.run());

        Ok((
            Self {
                peer,
                outbound,
                session,
                disconnect_policy: options.disconnect,
                task: Some(task),
            },
            deliveries_rx,
        ))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    /// Resolve once the session is over
    pub async fn closed(&self) {
        self.session.closed().await
    }

    pub async fn publish(&self, topic: &str, message: &str) -> Result<(), ConnectionError> {
        self.send(Frame::publish(topic, message, false)).await
    }

    /// Publish and retain on every matched topic
    pub async fn publish_retained(&self, topic: &str, message: &str) -> Result<(), ConnectionError> {
        self.send(Frame::publish(topic, message, true)).await
    }

    pub async fn subscribe(&self, pattern: &str) -> Result<(), ConnectionError> {
        self.send(Frame::subscribe(pattern)).await
    }

    pub async fn unsubscribe(&self, pattern: &str) -> Result<(), ConnectionError> {
        self.send(Frame::unsubscribe(pattern)).await
    }

    /// Ask for the subscribed topics; the reply arrives as
    /// [`Delivery::Subscriptions`]
    pub async fn list(&self) -> Result<(), ConnectionError> {
        self.send(Frame::control(Request::List)).await
    }

    /// Run a parsed command
    pub async fn execute(&mut self, command: Command) -> Result<(), ConnectionError> {
        match command.to_frame() {
            Some(frame) => self.send(frame).await,
            None => self.disconnect().await,
        }
    }

    /// Graceful close: send DISC and wait for DISC_ACK
    ///
    /// Returns `Closed` if the session ended without a DISC_ACK, including
    /// when it was already over. When the budget runs out the session is
    /// closed anyway and `Timeout` is returned.
    pub async fn disconnect(&mut self) -> Result<(), ConnectionError> {
        let result = self.disconnect_handshake().await;

        if let Some(mut task) = self.task.take() {
            if timeout(self.disconnect_policy.interval, &mut task).await.is_err() {
                task.abort();
            }
        }
        result
    }

    async fn disconnect_handshake(&self) -> Result<(), ConnectionError> {
        if self.session.is_cleanup() {
            return Err(ConnectionError::Closed);
        }
        if self.session.begin_disconnect() {
            self.send(Frame::control(Request::Disc)).await?;
        }
        if self.session.wait_disconnected(self.disconnect_policy).await {
            return Ok(());
        }
        if self.session.is_cleanup() {
            debug!("Session ended before DISC_ACK");
            return Err(ConnectionError::Closed);
        }
        warn!("Broker did not send DISC_ACK");
        self.session.mark_cleanup();
        Err(ConnectionError::Timeout)
    }

    async fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
        if self.session.is_cleanup() {
            return Err(ConnectionError::Closed);
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| ConnectionError::Closed)
    }
}

/// Socket-owning half of a client session
struct Listener {
    stream: TcpStream,
    read_buf: FrameBuf,
    outbound: mpsc::Receiver<Frame>,
    deliveries: mpsc::Sender<Delivery>,
    session: Arc<SessionTracker>,
}

impl Listener {
    async fn run(mut self) {
        if let Err(e) = self.serve().await {
            debug!("Client session ended: {}", e);
        }
        self.session.mark_cleanup();
    }

    async fn serve(&mut self) -> Result<(), ConnectionError> {
        let mut status = self.session.watch();
        loop {
            if status.borrow_and_update().cleanup {
                return Ok(());
            }

            tokio::select! {
                frame = self.outbound.recv() => {
                    let Some(frame) = frame else {
                        return Ok(());
                    };
                    write_frame(&mut self.stream, &frame).await?;
                }

                result = read_frame(&mut self.stream, &mut self.read_buf) => {
                    match result? {
                        ReadOutcome::Frame(frame) => {
                            if !self.handle_frame(frame).await? {
                                return Ok(());
                            }
                        }
                        ReadOutcome::Noise(n) => trace!("Discarded {} byte read", n),
                        ReadOutcome::Closed => return Err(ConnectionError::Closed),
                    }
                }

                changed = status.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<bool, ConnectionError> {
        let retained = frame.request == Request::PubRet;
        let delivery = match frame.request {
            Request::Pub | Request::PubRet => Delivery::Message {
                retained,
                topic: frame.topic,
                message: frame.message,
            },
            Request::List => Delivery::Subscriptions(
                frame
                    .message
                    .split(", ")
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            Request::Disc => {
                debug!("Broker requested disconnect, sending DISC_ACK");
                write_frame(&mut self.stream, &Frame::control(Request::DiscAck)).await?;
                self.session.mark_disconnected();
                return Ok(false);
            }
            Request::DiscAck => {
                debug!("DISC_ACK received");
                self.session.mark_disconnected();
                return Ok(false);
            }
            other => Delivery::Notice(other.to_string()),
        };

        // Never wait on the consumer: this task also writes DISC
        match self.deliveries.try_send(delivery) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("Delivery queue full, frame dropped"),
            // Nobody is listening
            Err(TrySendError::Closed(_)) => {}
        }
        Ok(true)
    }
}
