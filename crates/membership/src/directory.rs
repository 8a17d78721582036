use std::collections::HashMap;

use crate::record::{ServerRecord, ServerState};

/// Capability through which the hosting application exposes the local server
/// and accepts membership updates.
///
/// The application owns the storage and consistency of its own routing
/// table; the monitor only ever hands it complete views.
pub trait ServerDirectory: Send + Sync + 'static {
    /// Description of the local server. Read on every heartbeat so that
    /// address or role changes are picked up without restarting the monitor.
    fn current_server(&self) -> ServerRecord;

    /// Current lifecycle state of the local server.
    fn current_state(&self) -> ServerState;

    /// Atomically replaces the full membership view. Partial views are never
    /// delivered.
    fn replace_servers(&self, servers: HashMap<String, ServerRecord>);
}
