use crate::browser::{BrowseBatch, BrowseChange, ServiceBrowser, ServiceEndpoint};
use crate::config::ClientConfig;
use crate::error::Result;
use crate::registry::StationRegistry;
use crate::types::{Station, StationName};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};

/// Notable registry transitions caused by discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A station name was seen for the first time
    StationFound(StationName),

    /// The browse subsystem reported the service gone
    StationLost(StationName),

    /// A health probe or reconciliation demoted the station
    StationOffline(StationName),

    /// Address resolution succeeded
    AddressResolved { name: StationName, ip: String },
}

/// Discovery engine for DCC-EX command stations
///
/// Browses for the WiThrottle service type, keeps the [`StationRegistry`] in
/// sync with what the network advertises, and runs a recurring health check
/// that probes every station believed online.
///
/// # Example
///
/// ```no_run
/// use dccex_throttle::{ClientConfig, DiscoveryEngine, MdnsBrowser};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let engine = DiscoveryEngine::new(Arc::new(MdnsBrowser::new()?), ClientConfig::default());
///     engine.start(false)?;
///
///     tokio::time::sleep(tokio::time::Duration::from_secs(3)).await;
///
///     for station in engine.registry().snapshot() {
///         println!("{} at {} (online: {})", station.name, station.ip_address, station.is_online);
///     }
///
///     engine.stop(true);
///     Ok(())
/// }
/// ```
pub struct DiscoveryEngine {
    browser: Arc<dyn ServiceBrowser>,
    ctx: ProbeContext,
    stop_tx: Mutex<Option<broadcast::Sender<()>>>,
}

/// State shared with the browse pump, health check and probe tasks
#[derive(Clone)]
struct ProbeContext {
    registry: StationRegistry,
    config: Arc<ClientConfig>,
    event_tx: broadcast::Sender<DiscoveryEvent>,
    browsing: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    /// Held while a generation is retired and while a task applies its result
    fence: Arc<Mutex<()>>,
    resolving: Arc<Mutex<HashSet<StationName>>>,
}

impl ProbeContext {
    /// Whether work started under `generation` may still touch the registry
    fn is_current(&self, generation: u64) -> bool {
        self.browsing.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == generation
    }

    /// Run `f` only while `generation` is live; a stop cannot land between
    /// the check and the registry write
    fn if_current<R>(&self, generation: u64, f: impl FnOnce() -> R) -> Option<R> {
        let _fence = self.fence.lock().unwrap_or_else(PoisonError::into_inner);
        self.is_current(generation).then(f)
    }

    fn emit(&self, event: DiscoveryEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl DiscoveryEngine {
    /// Create an engine with its own registry
    pub fn new(browser: Arc<dyn ServiceBrowser>, config: ClientConfig) -> Self {
        Self::with_registry(browser, config, StationRegistry::new())
    }

    pub fn with_registry(
        browser: Arc<dyn ServiceBrowser>,
        config: ClientConfig,
        registry: StationRegistry,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            browser,
            ctx: ProbeContext {
                registry,
                config: Arc::new(config),
                event_tx,
                browsing: Arc::new(AtomicBool::new(false)),
                generation: Arc::new(AtomicU64::new(0)),
                fence: Arc::new(Mutex::new(())),
                resolving: Arc::new(Mutex::new(HashSet::new())),
            },
            stop_tx: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &StationRegistry {
        &self.ctx.registry
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.ctx.event_tx.subscribe()
    }

    pub fn is_browsing(&self) -> bool {
        self.ctx.browsing.load(Ordering::SeqCst)
    }

    /// Start browsing and the health check.
    ///
    /// If discovery is already running it is stopped first so the browse
    /// subsystem re-announces everything it sees. The station list survives
    /// a restart unless `clear_history` is set.
    pub fn start(&self, clear_history: bool) -> Result<()> {
        let mut stop_slot = self.stop_tx.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(tx) = stop_slot.take() {
            tracing::info!("Restarting discovery for fresh scan");
            self.halt(&tx, clear_history);
        }

        let config = &self.ctx.config;
        let batches = self
            .browser
            .browse(&config.service_type, &config.service_domain)
            .inspect_err(|e| tracing::error!("Discovery error: {}", e))?;

        let generation = self.ctx.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.ctx.browsing.store(true, Ordering::SeqCst);

        let (stop_tx, _) = broadcast::channel(1);
        tokio::spawn(run_browse_pump(
            self.ctx.clone(),
            generation,
            batches,
            stop_tx.subscribe(),
        ));
        tokio::spawn(run_health_check(
            self.ctx.clone(),
            generation,
            stop_tx.subscribe(),
        ));
        *stop_slot = Some(stop_tx);

        tracing::info!(
            "Started discovery for {}.{}",
            config.service_type,
            config.service_domain
        );
        Ok(())
    }

    /// Stop browsing and the health check.
    ///
    /// Probes already in flight finish on their own; their outcomes are
    /// dropped. With `clear_list` the registry is emptied.
    pub fn stop(&self, clear_list: bool) {
        let mut stop_slot = self.stop_tx.lock().unwrap_or_else(PoisonError::into_inner);
        match stop_slot.take() {
            Some(tx) => self.halt(&tx, clear_list),
            None if clear_list => self.ctx.registry.clear(),
            None => {}
        }
    }

    fn halt(&self, stop_tx: &broadcast::Sender<()>, clear_list: bool) {
        {
            let _fence = self.ctx.fence.lock().unwrap_or_else(PoisonError::into_inner);
            self.ctx.browsing.store(false, Ordering::SeqCst);
            self.ctx.generation.fetch_add(1, Ordering::SeqCst);
        }
        let _ = stop_tx.send(());

        let config = &self.ctx.config;
        self.browser
            .stop_browse(&config.service_type, &config.service_domain);

        if clear_list {
            self.ctx.registry.clear();
        }
        tracing::info!("Stopped discovery");
    }
}

impl Drop for DiscoveryEngine {
    fn drop(&mut self) {
        let stop_slot = self.stop_tx.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = stop_slot.take() {
            self.ctx.browsing.store(false, Ordering::SeqCst);
            let _ = tx.send(());
            let config = &self.ctx.config;
            self.browser
                .stop_browse(&config.service_type, &config.service_domain);
        }
    }
}

async fn run_browse_pump(
    ctx: ProbeContext,
    generation: u64,
    mut batches: mpsc::UnboundedReceiver<BrowseBatch>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            batch = batches.recv() => match batch {
                Some(batch) => {
                    let applied =
                        ctx.if_current(generation, || apply_batch(&ctx, generation, batch));
                    if applied.is_none() {
                        break;
                    }
                }
                None => {
                    tracing::debug!("Browse stream ended");
                    break;
                }
            }
        }
    }
}

/// Apply individual changes in order, then treat the visible result set as
/// authoritative.
fn apply_batch(ctx: &ProbeContext, generation: u64, batch: BrowseBatch) {
    let registry = &ctx.registry;
    let port = ctx.config.default_port;

    for change in batch.changes {
        match change {
            BrowseChange::Added(endpoint) => {
                tracing::info!("Service added: {}", endpoint.name);
                if registry.upsert_from_discovery(&endpoint.name, &endpoint.host_name, port) {
                    ctx.emit(DiscoveryEvent::StationFound(endpoint.name.clone()));
                }
                spawn_resolution(ctx, generation, &endpoint, port);
            }
            BrowseChange::Removed(endpoint) => {
                tracing::info!("Service removed: {}", endpoint.name);
                registry.mark_offline(&endpoint.name);
                ctx.emit(DiscoveryEvent::StationLost(endpoint.name));
            }
            BrowseChange::Changed(endpoint) => {
                tracing::debug!("Service changed: {}", endpoint.name);
            }
            BrowseChange::Identical => {}
        }
    }

    let mut visible = HashSet::with_capacity(batch.results.len());
    for endpoint in batch.results {
        if registry.upsert_from_discovery(&endpoint.name, &endpoint.host_name, port) {
            ctx.emit(DiscoveryEvent::StationFound(endpoint.name.clone()));
        }
        if registry.get(&endpoint.name).is_some_and(|s| !s.is_resolved()) {
            spawn_resolution(ctx, generation, &endpoint, port);
        }
        visible.insert(endpoint.name);
    }

    for name in registry.reconcile(&visible) {
        tracing::info!("{} no longer visible, marked offline", name);
        ctx.emit(DiscoveryEvent::StationOffline(name));
    }

    tracing::debug!(
        "Discovered stations updated: {:?}",
        registry
            .snapshot()
            .iter()
            .map(|s| format!("{} ({})", s.name, if s.is_online { "online" } else { "offline" }))
            .collect::<Vec<_>>()
    );
}

fn spawn_resolution(ctx: &ProbeContext, generation: u64, endpoint: &ServiceEndpoint, port: u16) {
    {
        let mut resolving = ctx.resolving.lock().unwrap_or_else(PoisonError::into_inner);
        if !resolving.insert(endpoint.name.clone()) {
            return;
        }
    }

    let ctx = ctx.clone();
    let name = endpoint.name.clone();
    let host = endpoint.host_name.clone();
    tokio::spawn(async move {
        resolve_address(&ctx, generation, &name, &host, port).await;
        ctx.resolving
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&name);
    });
}

/// Best-effort: connect to the advertised host and read back the peer IP
async fn resolve_address(ctx: &ProbeContext, generation: u64, name: &str, host: &str, port: u16) {
    let bound = ctx.config.resolve_timeout();
    let stream = match timeout(bound, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::debug!("Address resolution for {} failed: {}", name, e);
            return;
        }
        Err(_) => {
            tracing::debug!("Address resolution for {} timed out after {:?}", name, bound);
            return;
        }
    };

    let ip = match stream.peer_addr() {
        Ok(addr) => addr.ip().to_string(),
        Err(e) => {
            tracing::debug!("No peer address for {}: {}", name, e);
            return;
        }
    };
    drop(stream);

    let resolved = ctx.if_current(generation, || ctx.registry.set_resolved_address(name, &ip));
    if resolved == Some(true) {
        tracing::info!("Resolved IP for {}: {}", name, ip);
        ctx.emit(DiscoveryEvent::AddressResolved {
            name: name.to_string(),
            ip,
        });
    }
}

async fn run_health_check(
    ctx: ProbeContext,
    generation: u64,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let period = ctx.config.health_check_interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = ticker.tick() => {
                if !ctx.is_current(generation) {
                    break;
                }
                for station in ctx.registry.online() {
                    // Each probe carries its own timeout; the round does not wait
                    tokio::spawn(probe_station(ctx.clone(), generation, station));
                }
            }
        }
    }
}

/// Demote the station unless a TCP connect reaches ready within the bound
async fn probe_station(ctx: ProbeContext, generation: u64, station: Station) {
    let bound = ctx.config.probe_timeout();
    let target = (station.host_name.as_str(), station.port);

    let reason = match timeout(bound, TcpStream::connect(target)).await {
        Ok(Ok(_stream)) => return,
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("no answer within {:?}", bound),
    };

    match ctx.if_current(generation, || ctx.registry.mark_offline(&station.name)) {
        Some(true) => {
            tracing::warn!("Health check: {} marked offline ({})", station.name, reason);
            ctx.emit(DiscoveryEvent::StationOffline(station.name));
        }
        Some(false) => {}
        None => {
            tracing::debug!("Discarding probe result for {} after discovery stopped", station.name);
        }
    }
}

