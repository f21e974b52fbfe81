//! Trait seams over the Matter server runtime's singletons.
//!
//! The interaction-model engine, session managers and stores are owned by
//! the Matter runtime; the control-plane logic in this crate only reads and
//! requests through these interfaces. Each trait is deliberately small so a
//! component can depend on exactly the capability it uses, and so tests can
//! substitute a single seam without faking the whole server.
//!
//! Nothing here is cached between calls: idle checks and entry counts are
//! re-queried at the moment of use.

use std::sync::Arc;
use std::time::Duration;

use super::types::{AclEntry, AttributePath, FabricError, FabricIndex};

/// Post-commit callback registered on the fabric table.
///
/// Invoked after the fabric record is durably committed, never from
/// commissioning-request handling.
pub trait FabricDelegate: Send + Sync {
    fn on_fabric_committed(&self, fabric: FabricIndex);

    fn on_fabric_removed(&self, _fabric: FabricIndex) {}
}

/// Listener for access-control entry changes.
pub trait AclChangeListener: Send + Sync {
    fn on_entry_changed(&self, fabric: FabricIndex);
}

/// The fabric table: committed fabric records, iteration order stable.
pub trait FabricTable: Send + Sync {
    fn fabric_count(&self) -> usize;

    /// Initialized fabrics in table iteration order.
    fn fabrics(&self) -> Vec<FabricIndex>;

    fn delete(&self, fabric: FabricIndex) -> Result<(), FabricError>;

    fn add_delegate(&self, delegate: Arc<dyn FabricDelegate>);
}

/// Secure (operational) session manager.
pub trait SessionManager: Send + Sync {
    fn has_active_sessions(&self, fabric: FabricIndex) -> bool;

    fn expire_sessions_for_fabric(&self, fabric: FabricIndex);

    fn expire_all_sessions(&self);
}

/// CASE session manager (session-establishment state, distinct from the
/// secure-session table).
pub trait CaseSessionManager: Send + Sync {
    fn release_sessions_for_fabric(&self, fabric: FabricIndex);

    fn release_all_sessions(&self);
}

/// Read-only view of the interaction model's subscription state.
pub trait SubscriptionInfo: Send + Sync {
    fn has_active_subscription(&self, fabric: FabricIndex) -> bool;
}

/// Session resumption cache.
pub trait SessionResumptionStore: Send + Sync {
    fn delete_all(&self, fabric: FabricIndex) -> Result<(), FabricError>;
}

/// Group data (keys and mappings) provider.
pub trait GroupDataProvider: Send + Sync {
    fn remove_fabric(&self, fabric: FabricIndex) -> Result<(), FabricError>;
}

/// The access-control entry store.
pub trait AccessControl: Send + Sync {
    fn entry_count(&self, fabric: FabricIndex) -> Result<usize, FabricError>;

    fn create_entry(&self, entry: AclEntry) -> Result<usize, FabricError>;

    fn delete_entries_for_fabric(&self, fabric: FabricIndex) -> Result<(), FabricError>;

    fn reset_to_default(&self) -> Result<(), FabricError>;

    fn add_listener(&self, listener: Arc<dyn AclChangeListener>);
}

/// Interaction-model reporting engine.
pub trait ReportingEngine: Send + Sync {
    /// Mark an attribute dirty so active subscribers receive an update.
    /// Idempotent; has no failure path.
    fn set_dirty(&self, path: AttributePath);
}

/// The commissioning window manager.
pub trait CommissioningWindowManager: Send + Sync {
    /// Fabric on whose behalf the current window was opened, if any.
    /// Read fresh at every guard invocation; never cached.
    fn opener_fabric(&self) -> Option<FabricIndex>;

    fn open_basic_window(&self, timeout: Duration) -> Result<(), FabricError>;

    fn close_window(&self);

    fn is_window_open(&self) -> bool;
}

/// Fail-safe context guarding in-flight commissioning.
pub trait FailSafeContext: Send + Sync {
    fn force_fail_safe_expiry(&self);

    fn disarm_fail_safe(&self);
}

/// Persistent key-value store shared with the Matter runtime.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;

    fn put(&self, key: &str, value: &[u8]) -> Result<(), FabricError>;

    fn delete(&self, key: &str) -> Result<(), FabricError>;

    /// Erase everything (factory reset).
    fn factory_reset(&self) -> Result<(), FabricError>;

    fn flush(&self) -> Result<(), FabricError>;
}

/// Server lifecycle control used only by the full wipe.
pub trait ServerControl: Send + Sync {
    fn shutdown(&self);

    fn destroy_event_logging(&self);

    /// Queue a settings flush on the event loop; fire-and-forget.
    fn schedule_settings_flush(&self);
}

/// Aggregate of every collaborator handle the control plane consumes.
///
/// Owned by the server runtime object and passed by reference to the event
/// handlers; there are no process-wide singletons on this side.
#[derive(Clone)]
pub struct MatterContext {
    pub fabrics: Arc<dyn FabricTable>,
    pub sessions: Arc<dyn SessionManager>,
    pub case_sessions: Arc<dyn CaseSessionManager>,
    pub subscriptions: Arc<dyn SubscriptionInfo>,
    pub resumption: Arc<dyn SessionResumptionStore>,
    pub groups: Arc<dyn GroupDataProvider>,
    pub access_control: Arc<dyn AccessControl>,
    pub reporting: Arc<dyn ReportingEngine>,
    pub comm_window: Arc<dyn CommissioningWindowManager>,
    pub fail_safe: Arc<dyn FailSafeContext>,
    pub kv_store: Arc<dyn KeyValueStore>,
    pub server: Arc<dyn ServerControl>,
}
