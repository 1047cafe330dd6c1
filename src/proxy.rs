//! Connection proxy
//!
//! Relays one accepted client connection to the droplet and reports
//! liveness back to the owning controller while the connection is open.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

/// Signal emitted by a proxy session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// The upstream connection was established and relaying has begun
    Opened,
    /// Periodic pulse while at least one direction is still copying
    Active,
    /// Both directions have finished
    Disconnected,
}

/// Receiver of proxy session signals.
pub trait LivenessSink: Send + 'static {
    /// Deliver a signal. Returns false if nobody is listening any more.
    fn signal(&self, status: ConnStatus) -> bool;
}

impl LivenessSink for mpsc::UnboundedSender<ConnStatus> {
    fn signal(&self, status: ConnStatus) -> bool {
        self.send(status).is_ok()
    }
}

async fn copy_half<R, W>(mut reader: R, mut writer: W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut reader, &mut writer).await?;
    // Propagate EOF so the peer sees a half-close
    writer.shutdown().await?;
    Ok(copied)
}

/// Outcome of one direction, or None if it was aborted.
async fn finish(handle: &mut JoinHandle<std::io::Result<u64>>) -> Option<std::io::Result<u64>> {
    handle.await.ok()
}

/// Relay `client` to `target` until both directions close.
///
/// Emits [`ConnStatus::Opened`] once the upstream connection is up,
/// [`ConnStatus::Active`] every `pulse` while any direction is still
/// copying, and a single [`ConnStatus::Disconnected`] once both have
/// terminated. If one direction fails the other is torn down with it.
/// A failure to reach `target` is logged and nothing is signalled.
pub async fn relay<S: LivenessSink>(client: TcpStream, target: SocketAddr, sink: S, pulse: Duration) {
    let session = Uuid::new_v4();
    let peer = client.peer_addr().ok();

    let upstream = match TcpStream::connect(target).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%session, %target, error = %e, "Failed to connect to droplet");
            return;
        }
    };
    let _ = client.set_nodelay(true);
    let _ = upstream.set_nodelay(true);

    debug!(%session, ?peer, %target, "Proxy session started");
    sink.signal(ConnStatus::Opened);

    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    let mut outbound = tokio::spawn(copy_half(client_read, upstream_write));
    let mut inbound = tokio::spawn(copy_half(upstream_read, client_write));
    let mut outbound_done = false;
    let mut inbound_done = false;

    let mut ticker = interval_at(Instant::now() + pulse, pulse);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while !(outbound_done && inbound_done) {
        tokio::select! {
            result = finish(&mut outbound), if !outbound_done => {
                outbound_done = true;
                match result {
                    Some(Ok(bytes)) => debug!(%session, bytes, "Client closed its side"),
                    Some(Err(e)) => {
                        debug!(%session, error = %e, "Client to droplet copy failed");
                        inbound.abort();
                    }
                    None => {}
                }
            }
            result = finish(&mut inbound), if !inbound_done => {
                inbound_done = true;
                match result {
                    Some(Ok(bytes)) => debug!(%session, bytes, "Droplet closed its side"),
                    Some(Err(e)) => {
                        debug!(%session, error = %e, "Droplet to client copy failed");
                        outbound.abort();
                    }
                    None => {}
                }
            }
            _ = ticker.tick() => {
                sink.signal(ConnStatus::Active);
            }
        }
    }

    debug!(%session, "Proxy session closed");
    sink.signal(ConnStatus::Disconnected);
}
