use std::fmt;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};

use crate::error::SessionError;

/// Largest plaintext handshake message accepted from the access point.
const MAX_PLAIN_MESSAGE: usize = 1 << 20;

/// Byte stream carrying one access point connection.
pub trait ApStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ApStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn ApStream>;

/// A reachable access point: its address and an open stream to it.
pub struct Endpoint {
    pub address: String,
    pub stream: BoxedStream,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Source of access point connections; consulted once per connection attempt.
#[async_trait]
pub trait AccessPointResolver: Send + Sync {
    async fn resolve(&self) -> Result<Endpoint, SessionError>;
}

/// Resolver connecting over TCP to one of a fixed list of access points,
/// tried in random order.
#[derive(Debug, Clone)]
pub struct TcpResolver {
    access_points: Vec<String>,
}

impl TcpResolver {
    pub fn new(access_points: Vec<String>) -> Self {
        Self { access_points }
    }
}

#[async_trait]
impl AccessPointResolver for TcpResolver {
    async fn resolve(&self) -> Result<Endpoint, SessionError> {
        let mut candidates = self.access_points.clone();
        candidates.shuffle(&mut rand::thread_rng());

        let mut last_err = None;
        for address in candidates {
            match TcpStream::connect(address.as_str()).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    tracing::debug!(%address, "connected to access point");
                    return Ok(Endpoint {
                        address,
                        stream: Box::new(stream),
                    });
                }
                Err(err) => {
                    tracing::warn!(%address, error = %err, "access point unreachable");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no access points"))
            .into())
    }
}

/// Writes a length-prefixed plaintext message and returns the exact bytes
/// that went on the wire. The length counts itself and `prefix`.
pub(crate) async fn write_plain<S>(
    stream: &mut S,
    prefix: &[u8],
    body: &[u8],
) -> Result<Vec<u8>, SessionError>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let total = prefix.len() + 4 + body.len();
    let len = u32::try_from(total)
        .map_err(|_| SessionError::protocol("plaintext message too large"))?;
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(prefix);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(body);
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(frame)
}

/// Reads a `[u32 BE length incl. itself][body]` message, returning the whole
/// frame so it can be appended to the transcript verbatim.
pub(crate) async fn read_plain<S>(stream: &mut S) -> Result<Vec<u8>, SessionError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let len = stream.read_u32().await?;
    read_plain_body(stream, len).await
}

async fn read_plain_body<S>(stream: &mut S, len: u32) -> Result<Vec<u8>, SessionError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let len = len as usize;
    if !(4..=MAX_PLAIN_MESSAGE).contains(&len) {
        return Err(SessionError::protocol(format!(
            "invalid plaintext message length {}",
            len
        )));
    }
    let mut frame = vec![0u8; len];
    frame[..4].copy_from_slice(&(len as u32).to_be_bytes());
    stream.read_exact(&mut frame[4..]).await?;
    Ok(frame)
}

/// Outcome of the bounded read that follows the client response.
#[derive(Debug, PartialEq, Eq)]
pub enum EarlyRead {
    /// Nothing arrived inside the window.
    Timeout,
    /// A complete message arrived; the caller decodes it.
    Message(Vec<u8>),
}

/// Waits up to `window` for a complete plaintext message. Running out of
/// time after some but not all bytes arrived is a protocol error.
pub(crate) async fn read_plain_within<S>(
    stream: &mut S,
    window: Duration,
) -> Result<EarlyRead, SessionError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let deadline = Instant::now() + window;
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match time::timeout_at(deadline, stream.read(&mut header[filled..])).await {
            Err(_) if filled == 0 => return Ok(EarlyRead::Timeout),
            Err(_) => {
                return Err(SessionError::protocol(
                    "partial message received after client response",
                ))
            }
            Ok(Ok(0)) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "access point closed the connection",
                )
                .into())
            }
            Ok(Ok(n)) => filled += n,
            Ok(Err(err)) => return Err(err.into()),
        }
    }
    let len = u32::from_be_bytes(header);
    match time::timeout_at(deadline, read_plain_body(stream, len)).await {
        Ok(frame) => Ok(EarlyRead::Message(frame?)),
        Err(_) => Err(SessionError::protocol(
            "partial message received after client response",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn plain_frame_length_counts_prefix_and_itself() {
        let (mut a, mut b) = duplex(64);
        let written = write_plain(&mut a, &[0x00, 0x04], b"hello").await.unwrap();
        assert_eq!(&written[..6], &[0x00, 0x04, 0, 0, 0, 11]);

        let (mut c, mut d) = duplex(64);
        write_plain(&mut c, &[], b"abc").await.unwrap();
        let frame = read_plain(&mut d).await.unwrap();
        assert_eq!(frame, vec![0, 0, 0, 7, b'a', b'b', b'c']);

        let mut raw = [0u8; 11];
        b.read_exact(&mut raw).await.unwrap();
        assert_eq!(raw.to_vec(), written);
    }

    #[tokio::test]
    async fn undersized_length_is_protocol_error() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&[0, 0, 0, 2]).await.unwrap();
        assert!(matches!(
            read_plain(&mut b).await,
            Err(SessionError::Protocol(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_inside_window_is_timeout() {
        let (_a, mut b) = duplex(64);
        let res = read_plain_within(&mut b, Duration::from_secs(1)).await.unwrap();
        assert_eq!(res, EarlyRead::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_header_is_protocol_error() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&[0, 0]).await.unwrap();
        let res = read_plain_within(&mut b, Duration::from_secs(1)).await;
        assert!(matches!(res, Err(SessionError::Protocol(_))));
    }

    #[tokio::test]
    async fn complete_message_inside_window_is_returned() {
        let (mut a, mut b) = duplex(64);
        write_plain(&mut a, &[], b"fail").await.unwrap();
        let res = read_plain_within(&mut b, Duration::from_secs(1)).await.unwrap();
        assert_eq!(res, EarlyRead::Message(vec![0, 0, 0, 8, b'f', b'a', b'i', b'l']));
    }
}
