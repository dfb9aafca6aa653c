//! Unicast pairing
//!
//! Two messages over the socket that later carries the audio: the client
//! says `HELLO_FROM_CLIENT`, the server answers `HELLO_ACK` and from then on
//! streams to whoever said hello.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::error::{Error, NetworkError, ProtocolError};
use crate::network::MIN_TICK;
use crate::network::udp::is_transient;
use crate::protocol::{payload_is, CLIENT_HELLO, HELLO_ACK};
use crate::session::StopSignal;

/// Control payloads are short; anything longer is not ours anyway
const CONTROL_BUFFER: usize = 64;

/// How a handshake wait ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Paired with the given remote
    Paired(SocketAddr),
    /// The session was stopped first
    Cancelled,
}

/// Server side: wait for one datagram and pair with its sender if it is a hello.
///
/// Any other payload ends the attempt; a server pairs once per session.
pub async fn accept_client(socket: &UdpSocket, stop: &StopSignal) -> Result<HandshakeOutcome, Error> {
    let mut buf = [0u8; CONTROL_BUFFER];

    let (n, from) = loop {
        let received = tokio::select! {
            _ = stop.triggered() => return Ok(HandshakeOutcome::Cancelled),
            r = socket.recv_from(&mut buf) => r,
        };
        match received {
            Ok(r) => break r,
            Err(e) if is_transient(&e) => continue,
            Err(e) => return Err(NetworkError::ReceiveFailed(e).into()),
        }
    };

    if !payload_is(&buf[..n], CLIENT_HELLO) {
        return Err(ProtocolError::UnexpectedPayload {
            from,
            payload: String::from_utf8_lossy(&buf[..n]).into_owned(),
        }
        .into());
    }

    socket
        .send_to(HELLO_ACK.as_bytes(), from)
        .await
        .map_err(NetworkError::SendFailed)?;

    tracing::info!("Client {} paired", from);
    Ok(HandshakeOutcome::Paired(from))
}

/// Client side: say hello to `server` and wait for the ack.
///
/// The hello is repeated every `resend` until the ack arrives, so a server
/// that binds a moment late still pairs. No ack within `timeout` is fatal,
/// as is any reply other than the ack.
pub async fn connect_to_server(
    socket: &UdpSocket,
    server: SocketAddr,
    timeout: Duration,
    resend: Duration,
    stop: &StopSignal,
) -> Result<HandshakeOutcome, Error> {
    let deadline = Instant::now() + timeout;
    let mut resend_tick = tokio::time::interval(resend.max(MIN_TICK));
    let mut buf = [0u8; CONTROL_BUFFER];

    loop {
        tokio::select! {
            _ = stop.triggered() => return Ok(HandshakeOutcome::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(ProtocolError::Timeout(timeout.as_millis() as u64).into());
            }
            _ = resend_tick.tick() => {
                match socket.send_to(CLIENT_HELLO.as_bytes(), server).await {
                    Ok(_) => tracing::debug!("Hello sent to {}", server),
                    Err(e) if is_transient(&e) => {}
                    Err(e) => return Err(NetworkError::SendFailed(e).into()),
                }
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, from)) => {
                    if payload_is(&buf[..n], HELLO_ACK) {
                        tracing::info!("Server {} acknowledged", server);
                        return Ok(HandshakeOutcome::Paired(server));
                    }
                    return Err(ProtocolError::UnexpectedPayload {
                        from,
                        payload: String::from_utf8_lossy(&buf[..n]).into_owned(),
                    }
                    .into());
                }
                Err(e) if is_transient(&e) => {}
                Err(e) => return Err(NetworkError::ReceiveFailed(e).into()),
            },
        }
    }
}
