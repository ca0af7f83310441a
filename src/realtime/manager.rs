//! Registry of realtime connections keyed by application id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::realtime::connection::{ConnectionHandle, RealtimeOptions, CLOSE_NORMAL};
use crate::realtime::lock;
use crate::realtime::transport::{ConnectParams, Connector, WebSocketConnector};

/// Owns at most one [`ConnectionHandle`] per application.
///
/// Create one manager per process (or per test) and pass it to every
/// realtime client. Clones share the same registry.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    connector: Arc<dyn Connector>,
    options: RealtimeOptions,
    connections: Mutex<HashMap<String, ConnectionHandle>>,
}

impl ConnectionManager {
    /// Creates a manager that connects over websockets.
    pub fn new(options: RealtimeOptions) -> Self {
        Self::with_connector(Arc::new(WebSocketConnector), options)
    }

    /// Creates a manager that opens links through `connector`.
    pub fn with_connector(connector: Arc<dyn Connector>, options: RealtimeOptions) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                connector,
                options,
                connections: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn options(&self) -> &RealtimeOptions {
        &self.inner.options
    }

    /// Returns the handle for `app_id`, creating and starting it on first
    /// use. Later calls ignore `realtime_host`.
    pub fn get_or_create(&self, app_id: &str, realtime_host: &str) -> ConnectionHandle {
        let mut connections = lock(&self.inner.connections);
        if let Some(handle) = connections.get(app_id) {
            return handle.clone();
        }

        let params = ConnectParams {
            url: realtime_host.to_string(),
            realm: self.inner.options.realm.clone(),
        };
        debug!(event = "realtime_connection_created", app_id, url = %params.url);
        let handle = ConnectionHandle::start(
            app_id.to_string(),
            params,
            self.inner.options.clone(),
            Arc::clone(&self.inner.connector),
        );
        connections.insert(app_id.to_string(), handle.clone());
        handle
    }

    pub fn handle(&self, app_id: &str) -> Option<ConnectionHandle> {
        lock(&self.inner.connections).get(app_id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.connections).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every connection with `wamp.close.normal` and empties the
    /// registry. Close failures are logged and otherwise ignored.
    pub fn shutdown_all(&self) {
        let handles: Vec<ConnectionHandle> = lock(&self.inner.connections)
            .drain()
            .map(|(_, handle)| handle)
            .collect();

        for handle in handles {
            if let Err(err) = handle.close(CLOSE_NORMAL) {
                warn!(
                    event = "realtime_shutdown_close_failed",
                    app_id = %handle.app_id(),
                    error = %err
                );
            }
        }
    }

    /// Returns a guard that calls [`ConnectionManager::shutdown_all`] when
    /// dropped.
    pub fn shutdown_guard(&self) -> ShutdownGuard {
        ShutdownGuard {
            manager: self.clone(),
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &self.len())
            .field("options", &self.inner.options)
            .finish()
    }
}

/// Shuts every connection of a manager down on drop.
#[derive(Debug)]
#[must_use = "connections are shut down when the guard is dropped"]
pub struct ShutdownGuard {
    manager: ConnectionManager,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.manager.shutdown_all();
    }
}
