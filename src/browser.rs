//! Service-browse collaborator.
//!
//! The discovery engine only sees [`BrowseBatch`]es: a list of individual
//! changes plus the complete set of services currently visible. The
//! production implementation is [`MdnsBrowser`]; tests feed batches through
//! [`ChannelBrowser`].

use crate::error::{DccError, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// A browse result: one advertised service instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    /// Service instance name, e.g. `DCC-EX`
    pub name: String,

    /// Domain the service was found in, e.g. `local.`
    pub domain: String,

    /// Host to open TCP connections to
    pub host_name: String,
}

impl ServiceEndpoint {
    /// Endpoint whose host is derived from `<name>.<domain>`
    pub fn new(name: impl Into<String>, domain: impl Into<String>) -> Self {
        let name = name.into();
        let domain = domain.into();
        let host_name = format!("{}.{}", name, domain);
        Self {
            name,
            domain,
            host_name,
        }
    }

    pub fn with_host(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = host_name.into();
        self
    }
}

/// Individual change reported by the browse subsystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowseChange {
    Added(ServiceEndpoint),
    Removed(ServiceEndpoint),
    Changed(ServiceEndpoint),
    Identical,
}

/// Changes plus the full set of currently visible results
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrowseBatch {
    pub changes: Vec<BrowseChange>,
    pub results: Vec<ServiceEndpoint>,
}

/// Something that can browse for a service type on the local network
pub trait ServiceBrowser: Send + Sync + 'static {
    /// Start browsing. Batches are delivered until [`stop_browse`] is called
    /// or the receiver is dropped.
    ///
    /// [`stop_browse`]: ServiceBrowser::stop_browse
    fn browse(
        &self,
        service_type: &str,
        domain: &str,
    ) -> Result<mpsc::UnboundedReceiver<BrowseBatch>>;

    /// Cancel a browse started with the same arguments
    fn stop_browse(&self, service_type: &str, domain: &str);
}

/// Multicast DNS browser backed by `mdns-sd`
pub struct MdnsBrowser {
    daemon: ServiceDaemon,
}

impl MdnsBrowser {
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(|e| DccError::Discovery(e.to_string()))?;
        Ok(Self { daemon })
    }
}

fn ty_domain(service_type: &str, domain: &str) -> String {
    format!("{}.{}", service_type.trim_end_matches('.'), domain)
}

fn instance_name(fullname: &str, ty_domain: &str) -> String {
    fullname
        .strip_suffix(ty_domain)
        .unwrap_or(fullname)
        .trim_end_matches('.')
        .to_string()
}

impl ServiceBrowser for MdnsBrowser {
    fn browse(
        &self,
        service_type: &str,
        domain: &str,
    ) -> Result<mpsc::UnboundedReceiver<BrowseBatch>> {
        let ty_domain = ty_domain(service_type, domain);
        let events = self
            .daemon
            .browse(&ty_domain)
            .map_err(|e| DccError::Discovery(e.to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let domain = domain.to_string();

        tracing::info!("Started mDNS browse for {}", ty_domain);

        // mdns-sd hands out a blocking receiver; it ends with SearchStopped
        // after stop_browse, or disconnects when the daemon shuts down
        let pump = move || {
            let mut visible: BTreeMap<String, ServiceEndpoint> = BTreeMap::new();

            while let Ok(event) = events.recv() {
                let change = match event {
                    ServiceEvent::ServiceResolved(info) => {
                        let name = instance_name(info.get_fullname(), &ty_domain);
                        let host = info
                            .get_addresses()
                            .iter()
                            .next()
                            .map(|ip| ip.to_string())
                            .unwrap_or_else(|| info.get_hostname().to_string());
                        let endpoint =
                            ServiceEndpoint::new(name.clone(), domain.clone()).with_host(host);
                        match visible.insert(name, endpoint.clone()) {
                            None => BrowseChange::Added(endpoint),
                            Some(previous) if previous == endpoint => BrowseChange::Identical,
                            Some(_) => BrowseChange::Changed(endpoint),
                        }
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => {
                        let name = instance_name(&fullname, &ty_domain);
                        match visible.remove(&name) {
                            Some(endpoint) => BrowseChange::Removed(endpoint),
                            None => continue,
                        }
                    }
                    ServiceEvent::SearchStopped(_) => break,
                    other => {
                        tracing::debug!("mDNS event: {:?}", other);
                        continue;
                    }
                };

                let batch = BrowseBatch {
                    changes: vec![change],
                    results: visible.values().cloned().collect(),
                };
                if tx.send(batch).is_err() {
                    break;
                }
            }

            tracing::debug!("mDNS browse pump for {} finished", ty_domain);
        };
        std::thread::Builder::new()
            .name("mdns-browse".to_string())
            .spawn(pump)?;

        Ok(rx)
    }

    fn stop_browse(&self, service_type: &str, domain: &str) {
        let ty_domain = ty_domain(service_type, domain);
        if let Err(e) = self.daemon.stop_browse(&ty_domain) {
            tracing::warn!("Failed to stop mDNS browse for {}: {}", ty_domain, e);
        }
    }
}

impl Drop for MdnsBrowser {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.shutdown() {
            tracing::debug!("mDNS daemon shutdown: {}", e);
        }
    }
}

/// Browser driven by hand through [`ChannelBrowser::push`].
///
/// Useful for tests and for embedding a discovery source the crate does not
/// know about. Each `browse` call replaces the previous subscriber.
#[derive(Clone, Default)]
pub struct ChannelBrowser {
    state: Arc<Mutex<ChannelBrowserState>>,
}

#[derive(Default)]
struct ChannelBrowserState {
    tx: Option<mpsc::UnboundedSender<BrowseBatch>>,
    browse_calls: usize,
    stop_calls: usize,
}

impl ChannelBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a batch to the active browse. Returns `false` if nobody is
    /// browsing.
    pub fn push(&self, batch: BrowseBatch) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.tx.as_ref().is_some_and(|tx| tx.send(batch).is_ok())
    }

    pub fn browse_calls(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).browse_calls
    }

    pub fn stop_calls(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).stop_calls
    }
}

impl ServiceBrowser for ChannelBrowser {
    fn browse(
        &self,
        _service_type: &str,
        _domain: &str,
    ) -> Result<mpsc::UnboundedReceiver<BrowseBatch>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.tx = Some(tx);
        state.browse_calls += 1;
        Ok(rx)
    }

    fn stop_browse(&self, _service_type: &str, _domain: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.tx = None;
        state.stop_calls += 1;
    }
}
