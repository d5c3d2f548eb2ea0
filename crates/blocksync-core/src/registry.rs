// ── Shared connection registry ──
//
// One StreamConnection per endpoint, shared by every subscription that
// asks for it. Subscribers hold a `ConnectionLease`; dropping the last
// lease closes the connection, after an optional grace period.

use std::sync::Arc;
use std::time::Duration;

use blocksync_api::{Connector, StreamConfig, StreamConnection};
use dashmap::DashMap;
use tracing::{debug, info};
use url::Url;

struct Entry {
    connection: Arc<StreamConnection>,
    leases: usize,
    /// Bumped on every acquire; a delayed close only fires if nothing
    /// re-acquired the entry in the meantime.
    epoch: u64,
}

struct RegistryInner {
    connections: DashMap<Url, Entry>,
    connector: Arc<dyn Connector>,
    stream: StreamConfig,
    grace: Duration,
}

/// Reference-counted map of shared stream connections, keyed by endpoint.
///
/// Cheaply cloneable; clones share the same map.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn Connector>, stream: StreamConfig, grace: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connections: DashMap::new(),
                connector,
                stream,
                grace,
            }),
        }
    }

    /// Lease the connection for `endpoint`, spawning it on first use, and
    /// ask it to connect. Must be called inside a tokio runtime.
    pub fn acquire(&self, endpoint: &Url) -> ConnectionLease {
        let connection = {
            let mut entry = self
                .inner
                .connections
                .entry(endpoint.clone())
                .or_insert_with(|| {
                    info!(url = %endpoint, "Opening shared stream connection");
                    Entry {
                        connection: Arc::new(StreamConnection::spawn(
                            endpoint.clone(),
                            self.inner.stream.clone(),
                            Arc::clone(&self.inner.connector),
                        )),
                        leases: 0,
                        epoch: 0,
                    }
                });
            entry.leases += 1;
            entry.epoch += 1;
            debug!(url = %endpoint, leases = entry.leases, "Connection leased");
            Arc::clone(&entry.connection)
        };

        // Also revives a connection parked after exhausting its budget.
        connection.connect();

        ConnectionLease {
            registry: Arc::clone(&self.inner),
            endpoint: endpoint.clone(),
            connection,
        }
    }

    /// Number of live shared connections.
    pub fn len(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.connections.is_empty()
    }

    pub fn contains(&self, endpoint: &Url) -> bool {
        self.inner.connections.contains_key(endpoint)
    }

    /// Outstanding leases on `endpoint`.
    pub fn lease_count(&self, endpoint: &Url) -> usize {
        self.inner
            .connections
            .get(endpoint)
            .map_or(0, |entry| entry.leases)
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.inner.connections.len())
            .field("grace", &self.inner.grace)
            .finish_non_exhaustive()
    }
}

impl RegistryInner {
    fn release(self: &Arc<Self>, endpoint: &Url) {
        let epoch = {
            let Some(mut entry) = self.connections.get_mut(endpoint) else {
                return;
            };
            entry.leases = entry.leases.saturating_sub(1);
            debug!(url = %endpoint, leases = entry.leases, "Connection lease released");
            if entry.leases > 0 {
                return;
            }
            entry.epoch
        };

        if self.grace.is_zero() {
            self.close_if_unused(endpoint, epoch);
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(self);
                let endpoint = endpoint.clone();
                handle.spawn(async move {
                    tokio::time::sleep(inner.grace).await;
                    inner.close_if_unused(&endpoint, epoch);
                });
            }
            // Runtime already gone: nothing to wait on.
            Err(_) => self.close_if_unused(endpoint, epoch),
        }
    }

    fn close_if_unused(&self, endpoint: &Url, epoch: u64) {
        let removed = self
            .connections
            .remove_if(endpoint, |_, entry| entry.leases == 0 && entry.epoch == epoch);
        if let Some((_, entry)) = removed {
            info!(url = %endpoint, "Closing unused shared stream connection");
            entry.connection.close();
        }
    }
}

/// A subscriber's claim on a shared connection. Released on drop.
pub struct ConnectionLease {
    registry: Arc<RegistryInner>,
    endpoint: Url,
    connection: Arc<StreamConnection>,
}

impl ConnectionLease {
    pub fn connection(&self) -> &StreamConnection {
        &self.connection
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.registry.release(&self.endpoint);
    }
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("endpoint", &self.endpoint.as_str())
            .finish_non_exhaustive()
    }
}
