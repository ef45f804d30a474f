//! Makes this device findable and finds others.

pub mod payload;
pub mod radio;
pub mod registry;

pub use payload::EndpointPayload;
pub use radio::{Advertisement, Observation, Radio, UdpRadio};
pub use registry::{DiscoveryEvent, PeerRegistry};

use crate::Result;
use crate::peer::Peer;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct Discovery {
    radio: Arc<dyn Radio>,
    registry: Arc<PeerRegistry>,
    service_id: Uuid,
    stale_after: Duration,
    prune_every: Duration,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    advertising: Mutex<Option<Advertisement>>,
    scanning: Mutex<Option<CancellationToken>>,
}

impl Discovery {
    pub fn new(
        radio: Arc<dyn Radio>,
        service_id: Uuid,
        stale_after: Duration,
        prune_every: Duration,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> Self {
        Self {
            radio,
            registry: Arc::new(PeerRegistry::new()),
            service_id,
            stale_after,
            prune_every,
            events,
            advertising: Mutex::new(None),
            scanning: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Advertise our listener. A changed payload restarts the advertisement,
    /// an identical one is a no-op.
    pub fn start_advertising(&self, local_name: &str, payload: EndpointPayload) -> Result<()> {
        let advertisement = Advertisement {
            local_name: local_name.to_string(),
            service_data: payload.encode().to_vec(),
        };

        let mut current = self.advertising.lock();
        if current.as_ref() == Some(&advertisement) {
            return Ok(());
        }
        if current.take().is_some() {
            self.radio.stop_advertising();
        }

        self.radio
            .start_advertising(self.service_id, advertisement.clone())?;
        tracing::info!(
            "Advertising {} as {}",
            self.service_id,
            payload.socket_addr()
        );
        *current = Some(advertisement);
        Ok(())
    }

    pub fn stop_advertising(&self) {
        if self.advertising.lock().take().is_some() {
            self.radio.stop_advertising();
            tracing::info!("Advertising stopped");
        }
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising.lock().is_some()
    }

    /// Start scanning and the prune sweep that lives as long as the scan.
    pub fn start_scanning(&self) -> Result<()> {
        let mut scanning = self.scanning.lock();
        if scanning.is_some() {
            return Ok(());
        }

        let (obs_tx, obs_rx) = mpsc::unbounded_channel();
        self.radio.start_scanning(self.service_id, obs_tx)?;

        let token = CancellationToken::new();
        *scanning = Some(token.clone());

        let sweeper = Sweeper {
            registry: self.registry.clone(),
            events: self.events.clone(),
            service_id: self.service_id,
            stale_after: self.stale_after,
        };
        let prune_every = self.prune_every;
        tokio::spawn(async move {
            sweeper.run(obs_rx, prune_every, token).await;
        });

        tracing::info!("Scanning for {}", self.service_id);
        Ok(())
    }

    pub fn stop_scanning(&self) {
        if let Some(token) = self.scanning.lock().take() {
            token.cancel();
            self.radio.stop_scanning();
            tracing::info!("Scanning stopped");
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.lock().is_some()
    }

    /// Add a peer that is reachable without a radio sighting.
    pub fn add_manual_peer(&self, ip: IpAddr, port: u16, name: &str) -> Peer {
        let event = self
            .registry
            .add_manual(SocketAddr::new(ip, port), name, Instant::now());
        let peer = match &event {
            DiscoveryEvent::PeerFound(p) | DiscoveryEvent::PeerUpdated(p) => p.clone(),
            DiscoveryEvent::PeerLost(p) => p.clone(),
        };
        let _ = self.events.send(event);
        peer
    }

    /// Run one staleness sweep right now.
    pub fn sweep(&self, now: Instant) -> Vec<Peer> {
        sweep(&self.registry, &self.events, now, self.stale_after)
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.registry.snapshot()
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.stop_scanning();
        self.stop_advertising();
    }
}

fn sweep(
    registry: &PeerRegistry,
    events: &mpsc::UnboundedSender<DiscoveryEvent>,
    now: Instant,
    stale_after: Duration,
) -> Vec<Peer> {
    let lost = registry.prune(now, stale_after);
    for peer in &lost {
        let _ = events.send(DiscoveryEvent::PeerLost(peer.clone()));
    }
    lost
}

struct Sweeper {
    registry: Arc<PeerRegistry>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    service_id: Uuid,
    stale_after: Duration,
}

impl Sweeper {
    async fn run(
        self,
        mut observations: mpsc::UnboundedReceiver<Observation>,
        prune_every: Duration,
        token: CancellationToken,
    ) {
        let start = tokio::time::Instant::now() + prune_every;
        let mut prune = tokio::time::interval_at(start, prune_every);
        let mut radio_open = true;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                observation = observations.recv(), if radio_open => match observation {
                    Some(obs) if obs.service_id == self.service_id => {
                        if let Some(event) = self.registry.observe(&obs, Instant::now()) {
                            let _ = self.events.send(event);
                        }
                    }
                    Some(_) => {}
                    None => {
                        tracing::warn!("Radio stopped delivering observations");
                        radio_open = false;
                    }
                },
                _ = prune.tick() => {
                    sweep(&self.registry, &self.events, Instant::now(), self.stale_after);
                }
            }
        }
    }
}
