//! Bounded request/acknowledge exchange used to open a session

use tokio::io::AsyncRead;
use tokio::time::timeout;
use tracing::trace;

use super::{ConnectionError, RetryPolicy};
use crate::codec::{read_frame, FrameBuf, ReadOutcome};
use crate::protocol::Request;

/// Wait for a frame carrying `expected` within `policy`
///
/// Every read attempt spends one try: a try ends when the interval elapses
/// or when a short read is discarded. The first full frame decides the
/// outcome.
pub async fn expect_request<S>(
    stream: &mut S,
    buf: &mut FrameBuf,
    expected: Request,
    policy: RetryPolicy,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + Unpin,
{
    for _ in 0..policy.retries {
        match timeout(policy.interval, read_frame(stream, buf)).await {
            Err(_) => continue,
            Ok(outcome) => match outcome? {
                ReadOutcome::Frame(frame) if frame.request == expected => return Ok(()),
                ReadOutcome::Frame(frame) => {
                    return Err(ConnectionError::Rejected(frame.request.to_string()))
                }
                ReadOutcome::Noise(n) => trace!("Discarded {} byte read during handshake", n),
                ReadOutcome::Closed => return Err(ConnectionError::Closed),
            },
        }
    }
    Err(ConnectionError::Timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::codec::{encode_notice, frame_bytes, REJECTION_NOTICE};
    use crate::protocol::{Frame, FRAME_SIZE};

    const POLICY: RetryPolicy = RetryPolicy::new(3, Duration::from_millis(20));

    #[tokio::test]
    async fn test_expected_frame_completes() {
        let ack = frame_bytes(&Frame::control(Request::ConnAck));
        let mut stream = tokio_test::io::Builder::new().read(&ack).build();
        let mut buf = [0u8; FRAME_SIZE];
        expect_request(&mut stream, &mut buf, Request::ConnAck, POLICY)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_notice_is_rejection() {
        let notice = encode_notice(REJECTION_NOTICE);
        let mut stream = tokio_test::io::Builder::new().read(&notice).build();
        let mut buf = [0u8; FRAME_SIZE];
        let err = expect_request(&mut stream, &mut buf, Request::ConnAck, POLICY)
            .await
            .unwrap_err();
        match err {
            ConnectionError::Rejected(text) => assert_eq!(text, REJECTION_NOTICE),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_noise_spends_tries() {
        let mut stream = tokio_test::io::Builder::new()
            .read(b"abc")
            .read(b"def")
            .read(b"ghi")
            .build();
        let mut buf = [0u8; FRAME_SIZE];
        let err = expect_request(&mut stream, &mut buf, Request::Conn, POLICY)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let (mut client, _server) = tokio::io::duplex(FRAME_SIZE);
        let mut buf = [0u8; FRAME_SIZE];
        let start = tokio::time::Instant::now();
        let err = expect_request(&mut client, &mut buf, Request::Conn, POLICY)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout));
        assert!(start.elapsed() >= POLICY.budget());
    }

    #[tokio::test]
    async fn test_peer_close_aborts() {
        let (mut client, server) = tokio::io::duplex(FRAME_SIZE);
        drop(server);
        let mut buf = [0u8; FRAME_SIZE];
        let err = expect_request(&mut client, &mut buf, Request::Conn, POLICY)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Closed));
    }
}
