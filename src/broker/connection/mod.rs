//! Connection task
//!
//! One task per admitted connection. It owns the stream, writes frames
//! queued by the router, reads inbound frames and dispatches them. When the
//! broker shuts down it sends DISC itself and waits for the peer's DISC_ACK.
//! The task ends when the session is marked for cleanup, when the peer closes, or on
//! an I/O error; on exit it marks the session for cleanup and wakes the
//! collector.

mod handshake;

pub use handshake::{accept_handshake, reject};

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, trace, warn};

use super::registry::ConnectionHandle;
use super::router::MessageRouter;
use crate::codec::{read_frame, write_frame, FrameBuf, ReadOutcome};
use crate::protocol::{Frame, Request, FRAME_SIZE};
use crate::session::ConnectionError;

/// Connection handler - generic over the stream type
pub struct Connection<S> {
    stream: S,
    handle: Arc<ConnectionHandle>,
    outbound: mpsc::Receiver<Frame>,
    router: Arc<MessageRouter>,
    reclaim: Arc<Notify>,
    shutdown: watch::Receiver<bool>,
    read_buf: FrameBuf,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        handle: Arc<ConnectionHandle>,
        outbound: mpsc::Receiver<Frame>,
        router: Arc<MessageRouter>,
        reclaim: Arc<Notify>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            stream,
            handle,
            outbound,
            router,
            reclaim,
            shutdown,
            read_buf: [0u8; FRAME_SIZE],
        }
    }

    /// Run until the session ends, then hand the connection to the collector
    pub async fn run(mut self) {
        let id = self.handle.id();
        match self.serve().await {
            Ok(()) => debug!("Connection {} finished", id),
            Err(ConnectionError::Closed) => debug!("Connection {} closed by peer", id),
            Err(e) => debug!("Connection {} error: {}", id, e),
        }
        self.handle.session().mark_cleanup();
        self.reclaim.notify_one();
    }

    async fn serve(&mut self) -> Result<(), ConnectionError> {
        let mut status = self.handle.session().watch();
        loop {
            if status.borrow_and_update().cleanup {
                return Ok(());
            }
            if *self.shutdown.borrow_and_update() && self.handle.session().begin_disconnect() {
                debug!("Broker shutting down, sending DISC to {}", self.handle.id());
                write_frame(&mut self.stream, &Frame::control(Request::Disc)).await?;
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
                        ReadOutcome::Noise(n) => {
                            trace!("Discarded {} byte read from connection {}", n, self.handle.id());
                        }
                        ReadOutcome::Closed => return Err(ConnectionError::Closed),
                    }
                }

                changed = status.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }

                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Dispatch one inbound frame; returns false once the session is over
    async fn handle_frame(&mut self, frame: Frame) -> Result<bool, ConnectionError> {
        let id = self.handle.id();
        match &frame.request {
            Request::Pub | Request::PubRet => {
                let retain = frame.request == Request::PubRet;
                trace!("{} from {} to {}", frame.request, id, frame.topic);
                if let Err(e) = self.router.publish(&frame, retain) {
                    debug!("Publish from {} rejected: {}", id, e);
                }
            }
            Request::Sub => {
                if let Err(e) = self.router.subscribe(id, &frame.topic) {
                    debug!("Subscribe from {} rejected: {}", id, e);
                }
            }
            Request::Unsub => {
                if let Err(e) = self.router.unsubscribe(id, &frame.topic) {
                    debug!("Unsubscribe from {} rejected: {}", id, e);
                }
            }
            Request::List => {
                let topics = self.router.list(id).unwrap_or_default();
                write_frame(&mut self.stream, &Frame::new(Request::List, "", topics)).await?;
            }
            Request::Disc => {
                debug!("DISC from {}, sending DISC_ACK", id);
                write_frame(&mut self.stream, &Frame::control(Request::DiscAck)).await?;
                self.handle.session().mark_disconnected();
                return Ok(false);
            }
            Request::DiscAck => {
                debug!("DISC_ACK from {}", id);
                self.handle.session().mark_disconnected();
                return Ok(false);
            }
            Request::Conn | Request::ConnAck => {
                warn!("Unexpected {} from connection {}", frame.request, id);
            }
            Request::Unknown(text) => {
                warn!("Unknown request from connection {}: {:?}", id, text);
            }
        }
        Ok(true)
    }
}
