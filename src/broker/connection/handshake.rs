//! Admission handshake

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

use crate::codec::{encode_notice, write_frame, REJECTION_NOTICE};
use crate::protocol::{Frame, Request, FRAME_SIZE};
use crate::session::{expect_request, ConnectionError, RetryPolicy};

/// Wait for CONN within `policy` and answer with CONN_ACK
pub async fn accept_handshake<S>(stream: &mut S, policy: RetryPolicy) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; FRAME_SIZE];
    expect_request(stream, &mut buf, Request::Conn, policy).await?;
    write_frame(stream, &Frame::control(Request::ConnAck)).await?;
    Ok(())
}

/// Send the rejection notice and close the stream
///
/// Whatever the peer already sent is drained for at most `linger` so that
/// the close does not reset the connection before the notice is read.
pub async fn reject<S>(mut stream: S, linger: std::time::Duration)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let notice = encode_notice(REJECTION_NOTICE);
    if let Err(e) = stream.write_all(&notice).await {
        debug!("Failed to send rejection notice: {}", e);
        return;
    }
    let _ = stream.shutdown().await;

    let mut sink = [0u8; FRAME_SIZE];
    let _ = timeout(linger, async {
        while let Ok(n) = stream.read(&mut sink).await {
            if n == 0 {
                break;
            }
        }
    })
    .await;
}
