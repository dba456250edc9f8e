//! TCP transport for PBC envelopes
//!
//! One JSON envelope per line. Outbound connections are opened by
//! [`TcpConnector`] on behalf of the peer link manager; inbound connections
//! are accepted by [`Listener`] and decoded into a shared channel.

use crate::peer::{Connector, Link};
use crate::types::{Envelope, ZoneId};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default TCP port for PBC nodes
pub const DEFAULT_PORT: u16 = 9990;

/// Maximum frame size, newline included (64KB is far above any envelope)
const MAX_FRAME_SIZE: usize = 65536;

/// Opens TCP connections to configured peer addresses
pub struct TcpConnector {
    peers: HashMap<ZoneId, SocketAddr>,
}

impl TcpConnector {
    pub fn new(peers: HashMap<ZoneId, SocketAddr>) -> Self {
        Self { peers }
    }
}

impl Connector for TcpConnector {
    fn connect(&self, zone: ZoneId) -> BoxFuture<'_, io::Result<Box<dyn Link>>> {
        let addr = self.peers.get(&zone).copied();
        Box::pin(async move {
            let addr = addr.ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no address for zone {}", zone),
                )
            })?;

            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            debug!("Transport: Opened connection to zone {} at {}", zone, addr);

            Ok(Box::new(TcpLink {
                writer: BufWriter::new(stream),
            }) as Box<dyn Link>)
        })
    }
}

struct TcpLink {
    writer: BufWriter<TcpStream>,
}

impl Link for TcpLink {
    fn send<'a>(&'a mut self, envelope: &'a Envelope) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            let mut bytes = envelope
                .to_bytes()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            bytes.push(b'\n');

            self.writer.write_all(&bytes).await?;
            self.writer.flush().await
        })
    }
}

/// Accepts inbound peer connections
pub struct Listener {
    listener: TcpListener,
}

impl Listener {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// Get the local address this listener is bound to
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start accepting in background, forwarding decoded envelopes to
    /// `inbound` until `shutdown` flips to true.
    pub fn start_receive(
        self,
        inbound: mpsc::Sender<Envelope>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Transport: Listening on {}",
                self.listener
                    .local_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| "?".into())
            );

            loop {
                tokio::select! {
                    accepted = self.listener.accept() => match accepted {
                        Ok((stream, src)) => {
                            debug!("Transport: Accepted connection from {}", src);
                            tokio::spawn(read_frames(stream, src, inbound.clone(), shutdown.clone()));
                        }
                        Err(e) => {
                            error!("Transport: Accept error: {}", e);
                        }
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Transport: Listener stopped");
        })
    }
}

/// Read newline-terminated frames until the peer closes, a frame outgrows
/// `MAX_FRAME_SIZE`, or shutdown.
async fn read_frames(
    stream: TcpStream,
    src: SocketAddr,
    inbound: mpsc::Sender<Envelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reader = BufReader::new(stream);
    let mut frame = Vec::new();

    loop {
        // One byte past the cap, to tell a full frame from an oversized one
        let limit = (MAX_FRAME_SIZE + 1).saturating_sub(frame.len()) as u64;
        let mut limited = (&mut reader).take(limit);
        let read = tokio::select! {
            read = limited.read_until(b'\n', &mut frame) => read,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        match read {
            Ok(0) => {
                debug!("Transport: Connection from {} closed", src);
                break;
            }
            Ok(_) if frame.last() != Some(&b'\n') => {
                if frame.len() > MAX_FRAME_SIZE {
                    warn!(
                        "Transport: Frame from {} exceeds {} bytes, closing connection",
                        src, MAX_FRAME_SIZE
                    );
                } else {
                    debug!("Transport: Connection from {} closed mid-frame", src);
                }
                break;
            }
            Ok(_) => {
                if !frame.iter().all(u8::is_ascii_whitespace) {
                    match Envelope::from_bytes(&frame) {
                        Ok(envelope) => {
                            debug!("Transport: Received {} from {}", envelope.topic, src);
                            if inbound.send(envelope).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Transport: Failed to parse frame from {}: {}", src, e);
                        }
                    }
                }
                frame.clear();
            }
            Err(e) => {
                warn!("Transport: Read error from {}: {}", src, e);
                break;
            }
        }
    }
}
