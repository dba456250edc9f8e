//! Outbound peer links.
//!
//! One logical link per zone, created on first use. A link without a live
//! connection is (re)connected at most once per backoff interval; inside
//! the interval sends to that zone are skipped so an unreachable peer never
//! holds up the rest of the fleet. Connects and publishes are bounded by
//! their own timeouts; a failed publish tears the connection down and puts
//! the link into backoff.
//!
//! Messages for this node's own zone go straight to the local inbound
//! channel.

use crate::error::LinkError;
use crate::types::{Envelope, ZoneId};
use futures_util::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Minimum time between connection attempts to the same zone
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(30);

/// Bound on establishing a connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on a single publish over a live connection
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(3);

/// An established connection to one remote zone
pub trait Link: Send {
    /// Deliver one envelope. Best effort; no acknowledgement.
    fn send<'a>(&'a mut self, envelope: &'a Envelope) -> BoxFuture<'a, io::Result<()>>;
}

/// Establishes connections to remote zones
pub trait Connector: Send + Sync {
    fn connect(&self, zone: ZoneId) -> BoxFuture<'_, io::Result<Box<dyn Link>>>;
}

/// Link timing parameters
#[derive(Debug, Clone, Copy)]
pub struct LinkTiming {
    pub backoff: Duration,
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_BACKOFF,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }
}

/// Connection state of a peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
    Backoff,
}

/// Link to one remote zone
pub struct PeerLink {
    remote: ZoneId,
    connection: Option<Box<dyn Link>>,
    last_attempt: Option<Instant>,
    state: LinkState,
}

impl PeerLink {
    fn new(remote: ZoneId) -> Self {
        Self {
            remote,
            connection: None,
            last_attempt: None,
            state: LinkState::Disconnected,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    fn tear_down(&mut self, now: Instant) {
        self.connection = None;
        self.last_attempt = Some(now);
        self.state = LinkState::Backoff;
    }

    fn close(&mut self) {
        self.connection = None;
        self.state = LinkState::Disconnected;
    }

    async fn connect(
        &mut self,
        connector: &dyn Connector,
        timing: &LinkTiming,
    ) -> Result<Box<dyn Link>, LinkError> {
        let now = Instant::now();
        if let Some(last) = self.last_attempt {
            let elapsed = now.saturating_duration_since(last);
            if elapsed <= timing.backoff {
                return Err(LinkError::Backoff {
                    zone: self.remote,
                    retry_in: timing.backoff - elapsed,
                });
            }
        }

        debug!("Peers: Connecting to zone {}", self.remote);
        self.last_attempt = Some(now);

        match timeout(timing.connect_timeout, connector.connect(self.remote)).await {
            Ok(Ok(link)) => {
                info!("Peers: Connected to zone {}", self.remote);
                self.state = LinkState::Connected;
                Ok(link)
            }
            Ok(Err(e)) => {
                warn!("Peers: Connection to zone {} failed: {}", self.remote, e);
                self.state = LinkState::Backoff;
                Err(LinkError::Connect {
                    zone: self.remote,
                    source: e,
                })
            }
            Err(_) => {
                warn!(
                    "Peers: Connection to zone {} timed out after {:?}",
                    self.remote, timing.connect_timeout
                );
                self.state = LinkState::Backoff;
                Err(LinkError::ConnectTimeout(self.remote))
            }
        }
    }

    async fn publish(
        &mut self,
        connector: &dyn Connector,
        timing: &LinkTiming,
        envelope: &Envelope,
    ) -> Result<(), LinkError> {
        let mut conn = match self.connection.take() {
            Some(conn) => conn,
            None => self.connect(connector, timing).await?,
        };

        let sent = timeout(timing.publish_timeout, conn.send(envelope)).await;
        match sent {
            Ok(Ok(())) => {
                self.connection = Some(conn);
                self.state = LinkState::Connected;
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(
                    "Peers: Publish to zone {} failed, tearing down link: {}",
                    self.remote, e
                );
                self.tear_down(Instant::now());
                Err(LinkError::Publish {
                    zone: self.remote,
                    source: e,
                })
            }
            Err(_) => {
                warn!(
                    "Peers: Publish to zone {} timed out, tearing down link",
                    self.remote
                );
                self.tear_down(Instant::now());
                Err(LinkError::PublishTimeout(self.remote))
            }
        }
    }
}

/// Registry of peer links keyed by zone id
pub struct PeerLinkManager {
    own_zone: ZoneId,
    num_zones: ZoneId,
    connector: Arc<dyn Connector>,
    local: mpsc::Sender<Envelope>,
    timing: LinkTiming,
    links: Mutex<HashMap<ZoneId, Arc<AsyncMutex<PeerLink>>>>,
}

impl PeerLinkManager {
    pub fn new(
        own_zone: ZoneId,
        num_zones: ZoneId,
        connector: Arc<dyn Connector>,
        local: mpsc::Sender<Envelope>,
        timing: LinkTiming,
    ) -> Self {
        Self {
            own_zone,
            num_zones,
            connector,
            local,
            timing,
            links: Mutex::new(HashMap::new()),
        }
    }

    fn link(&self, zone: ZoneId) -> Arc<AsyncMutex<PeerLink>> {
        self.links
            .lock()
            .entry(zone)
            .or_insert_with(|| Arc::new(AsyncMutex::new(PeerLink::new(zone))))
            .clone()
    }

    /// Publish to one zone with a bounded wait
    pub async fn publish(&self, zone: ZoneId, envelope: &Envelope) -> Result<(), LinkError> {
        if zone == self.own_zone {
            return match timeout(self.timing.publish_timeout, self.local.send(envelope.clone())).await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(LinkError::LocalClosed),
                Err(_) => Err(LinkError::PublishTimeout(zone)),
            };
        }

        let link = self.link(zone);
        let mut link = link.lock().await;
        let result = link
            .publish(self.connector.as_ref(), &self.timing, envelope)
            .await;

        if let Err(LinkError::Backoff { retry_in, .. }) = &result {
            debug!(
                "Peers: Zone {} in backoff, skipping {} (retry in {:?})",
                zone, envelope.topic, retry_in
            );
        }
        result
    }

    /// Publish to every zone, including this one, concurrently
    pub async fn broadcast(&self, envelope: &Envelope) -> Vec<(ZoneId, Result<(), LinkError>)> {
        let sends =
            (1..=self.num_zones).map(|zone| async move { (zone, self.publish(zone, envelope).await) });
        join_all(sends).await
    }

    /// State of a zone's link, `None` if never used
    pub async fn link_state(&self, zone: ZoneId) -> Option<LinkState> {
        let link = self.links.lock().get(&zone).cloned()?;
        let state = link.lock().await.state();
        Some(state)
    }

    /// Close every connection
    pub async fn shutdown(&self) {
        let links: Vec<_> = self.links.lock().values().cloned().collect();
        for link in links {
            link.lock().await.close();
        }
        debug!("Peers: All links closed");
    }
}
