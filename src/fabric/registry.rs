//! In-memory control-plane registry backing the collaborator traits.
//!
//! The rs-matter runtime owns the wire-level fabric state opaquely; this
//! registry is the application's authoritative bookkeeping of fabric
//! records, sessions, subscriptions, ACL entries and the commissioning
//! window, updated from stack events. All trait methods take `&self`;
//! interior mutability via `parking_lot` locks, mutation serialized by the
//! event loop by convention.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info};
use parking_lot::RwLock;

use super::services::{
    AccessControl, AclChangeListener, CaseSessionManager, CommissioningWindowManager,
    FabricDelegate, FabricTable, FailSafeContext, GroupDataProvider, ReportingEngine,
    ServerControl, SessionManager, SessionResumptionStore, SubscriptionInfo,
};
use super::types::{AclEntry, AttributePath, FabricError, FabricIndex};

/// Live state for one committed fabric.
#[derive(Debug, Default, Clone)]
struct FabricRecord {
    case_sessions: usize,
    subscriptions: usize,
    resumption_entries: usize,
    group_entries: usize,
}

#[derive(Default)]
struct WindowState {
    open: bool,
    opener: Option<FabricIndex>,
}

#[derive(Default)]
struct Inner {
    fabrics: BTreeMap<FabricIndex, FabricRecord>,
    acl: BTreeMap<FabricIndex, Vec<AclEntry>>,
    window: WindowState,
    delegates: Vec<Arc<dyn FabricDelegate>>,
    acl_listeners: Vec<Arc<dyn AclChangeListener>>,
    dirty_paths: Vec<AttributePath>,
    fail_safe_armed: bool,
    next_index: u8,
}

/// Shared registry implementing every collaborator seam.
pub struct FabricRegistry {
    inner: RwLock<Inner>,
    shut_down: AtomicBool,
}

impl Default for FabricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FabricRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                next_index: 1,
                ..Default::default()
            }),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Commit a new fabric record and fire post-commit delegates.
    ///
    /// Delegates run after the record is in the table, mirroring the fabric
    /// table's post-commit callback ordering.
    pub fn commit_fabric(&self) -> FabricIndex {
        let (index, delegates) = {
            let mut inner = self.inner.write();
            let index = FabricIndex(inner.next_index);
            inner.next_index = inner.next_index.wrapping_add(1).max(1);
            inner.fabrics.insert(index, FabricRecord::default());
            (index, inner.delegates.clone())
        };

        info!("Fabric {} committed", index);
        for delegate in delegates {
            delegate.on_fabric_committed(index);
        }
        index
    }

    /// Record an established CASE session for a fabric.
    pub fn session_started(&self, fabric: FabricIndex) {
        if let Some(record) = self.inner.write().fabrics.get_mut(&fabric) {
            record.case_sessions += 1;
        }
    }

    pub fn session_ended(&self, fabric: FabricIndex) {
        if let Some(record) = self.inner.write().fabrics.get_mut(&fabric) {
            record.case_sessions = record.case_sessions.saturating_sub(1);
        }
    }

    pub fn subscription_started(&self, fabric: FabricIndex) {
        if let Some(record) = self.inner.write().fabrics.get_mut(&fabric) {
            record.subscriptions += 1;
        }
    }

    pub fn subscription_ended(&self, fabric: FabricIndex) {
        if let Some(record) = self.inner.write().fabrics.get_mut(&fabric) {
            record.subscriptions = record.subscriptions.saturating_sub(1);
        }
    }

    pub fn record_resumption_entry(&self, fabric: FabricIndex) {
        if let Some(record) = self.inner.write().fabrics.get_mut(&fabric) {
            record.resumption_entries += 1;
        }
    }

    pub fn record_group_entry(&self, fabric: FabricIndex) {
        if let Some(record) = self.inner.write().fabrics.get_mut(&fabric) {
            record.group_entries += 1;
        }
    }

    pub fn arm_fail_safe(&self) {
        self.inner.write().fail_safe_armed = true;
    }

    pub fn is_fail_safe_armed(&self) -> bool {
        self.inner.read().fail_safe_armed
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Attribute paths marked dirty since construction; test observability.
    pub fn dirty_paths(&self) -> Vec<AttributePath> {
        self.inner.read().dirty_paths.clone()
    }

    pub fn acl_entries(&self, fabric: FabricIndex) -> Vec<AclEntry> {
        self.inner
            .read()
            .acl
            .get(&fabric)
            .cloned()
            .unwrap_or_default()
    }

    fn notify_acl_listeners(&self, fabric: FabricIndex) {
        let listeners = self.inner.read().acl_listeners.clone();
        for listener in listeners {
            listener.on_entry_changed(fabric);
        }
    }
}

impl FabricTable for FabricRegistry {
    fn fabric_count(&self) -> usize {
        self.inner.read().fabrics.len()
    }

    fn fabrics(&self) -> Vec<FabricIndex> {
        self.inner.read().fabrics.keys().copied().collect()
    }

    fn delete(&self, fabric: FabricIndex) -> Result<(), FabricError> {
        let delegates = {
            let mut inner = self.inner.write();
            if inner.fabrics.remove(&fabric).is_none() {
                return Err(FabricError::NotFound(fabric));
            }
            inner.delegates.clone()
        };
        for delegate in delegates {
            delegate.on_fabric_removed(fabric);
        }
        Ok(())
    }

    fn add_delegate(&self, delegate: Arc<dyn FabricDelegate>) {
        self.inner.write().delegates.push(delegate);
    }
}

impl SessionManager for FabricRegistry {
    fn has_active_sessions(&self, fabric: FabricIndex) -> bool {
        self.inner
            .read()
            .fabrics
            .get(&fabric)
            .is_some_and(|r| r.case_sessions > 0)
    }

    fn expire_sessions_for_fabric(&self, fabric: FabricIndex) {
        if let Some(record) = self.inner.write().fabrics.get_mut(&fabric) {
            record.case_sessions = 0;
        }
    }

    fn expire_all_sessions(&self) {
        for record in self.inner.write().fabrics.values_mut() {
            record.case_sessions = 0;
        }
    }
}

impl CaseSessionManager for FabricRegistry {
    fn release_sessions_for_fabric(&self, fabric: FabricIndex) {
        // Session-establishment state shares the record's session count.
        if let Some(record) = self.inner.write().fabrics.get_mut(&fabric) {
            record.case_sessions = 0;
        }
    }

    fn release_all_sessions(&self) {
        for record in self.inner.write().fabrics.values_mut() {
            record.case_sessions = 0;
        }
    }
}

impl SubscriptionInfo for FabricRegistry {
    fn has_active_subscription(&self, fabric: FabricIndex) -> bool {
        self.inner
            .read()
            .fabrics
            .get(&fabric)
            .is_some_and(|r| r.subscriptions > 0)
    }
}

impl SessionResumptionStore for FabricRegistry {
    fn delete_all(&self, fabric: FabricIndex) -> Result<(), FabricError> {
        match self.inner.write().fabrics.get_mut(&fabric) {
            Some(record) => {
                record.resumption_entries = 0;
                Ok(())
            }
            None => Err(FabricError::NotFound(fabric)),
        }
    }
}

impl GroupDataProvider for FabricRegistry {
    fn remove_fabric(&self, fabric: FabricIndex) -> Result<(), FabricError> {
        match self.inner.write().fabrics.get_mut(&fabric) {
            Some(record) => {
                record.group_entries = 0;
                Ok(())
            }
            None => Err(FabricError::NotFound(fabric)),
        }
    }
}

impl AccessControl for FabricRegistry {
    fn entry_count(&self, fabric: FabricIndex) -> Result<usize, FabricError> {
        Ok(self
            .inner
            .read()
            .acl
            .get(&fabric)
            .map(Vec::len)
            .unwrap_or(0))
    }

    fn create_entry(&self, entry: AclEntry) -> Result<usize, FabricError> {
        let fabric = entry.fabric;
        let index = {
            let mut inner = self.inner.write();
            let entries = inner.acl.entry(fabric).or_default();
            entries.push(entry);
            entries.len() - 1
        };
        self.notify_acl_listeners(fabric);
        Ok(index)
    }

    fn delete_entries_for_fabric(&self, fabric: FabricIndex) -> Result<(), FabricError> {
        let removed = self.inner.write().acl.remove(&fabric).is_some();
        if removed {
            self.notify_acl_listeners(fabric);
            Ok(())
        } else {
            Err(FabricError::NotFound(fabric))
        }
    }

    fn reset_to_default(&self) -> Result<(), FabricError> {
        self.inner.write().acl.clear();
        Ok(())
    }

    fn add_listener(&self, listener: Arc<dyn AclChangeListener>) {
        self.inner.write().acl_listeners.push(listener);
    }
}

impl ReportingEngine for FabricRegistry {
    fn set_dirty(&self, path: AttributePath) {
        self.inner.write().dirty_paths.push(path);
    }
}

impl CommissioningWindowManager for FabricRegistry {
    fn opener_fabric(&self) -> Option<FabricIndex> {
        self.inner.read().window.opener
    }

    fn open_basic_window(&self, timeout: Duration) -> Result<(), FabricError> {
        let mut inner = self.inner.write();
        inner.window.open = true;
        info!(
            "Commissioning window open for {} seconds",
            timeout.as_secs()
        );
        Ok(())
    }

    fn close_window(&self) {
        let mut inner = self.inner.write();
        inner.window.open = false;
        inner.window.opener = None;
    }

    fn is_window_open(&self) -> bool {
        self.inner.read().window.open
    }
}

impl FabricRegistry {
    /// Record the fabric a window was opened on behalf of (enhanced window).
    pub fn set_window_opener(&self, opener: Option<FabricIndex>) {
        self.inner.write().window.opener = opener;
    }
}

impl FailSafeContext for FabricRegistry {
    fn force_fail_safe_expiry(&self) {
        self.inner.write().fail_safe_armed = false;
    }

    fn disarm_fail_safe(&self) {
        self.inner.write().fail_safe_armed = false;
    }
}

impl ServerControl for FabricRegistry {
    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        info!("Matter server shut down");
    }

    fn destroy_event_logging(&self) {
        debug!("Event logging destroyed");
    }

    fn schedule_settings_flush(&self) {
        debug!("Settings flush scheduled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::types::{AuthMode, CASE_ADMIN_SUBJECT_ID, Privilege};
    use std::sync::atomic::AtomicUsize;

    struct CountingDelegate {
        commits: AtomicUsize,
        removals: AtomicUsize,
    }

    impl FabricDelegate for CountingDelegate {
        fn on_fabric_committed(&self, _fabric: FabricIndex) {
            self.commits.fetch_add(1, Ordering::SeqCst);
        }

        fn on_fabric_removed(&self, _fabric: FabricIndex) {
            self.removals.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn commit_assigns_increasing_indices_and_fires_delegates() {
        let registry = FabricRegistry::new();
        let delegate = Arc::new(CountingDelegate {
            commits: AtomicUsize::new(0),
            removals: AtomicUsize::new(0),
        });
        registry.add_delegate(delegate.clone());

        let f1 = registry.commit_fabric();
        let f2 = registry.commit_fabric();
        assert!(f1 < f2);
        assert_eq!(registry.fabric_count(), 2);
        assert_eq!(delegate.commits.load(Ordering::SeqCst), 2);

        registry.delete(f1).unwrap();
        assert_eq!(delegate.removals.load(Ordering::SeqCst), 1);
        assert_eq!(registry.fabric_count(), 1);
    }

    #[test]
    fn delete_missing_fabric_is_not_found() {
        let registry = FabricRegistry::new();
        assert_eq!(
            registry.delete(FabricIndex(9)),
            Err(FabricError::NotFound(FabricIndex(9)))
        );
    }

    #[test]
    fn acl_listener_fires_on_create_and_delete() {
        struct Listener(AtomicUsize);
        impl AclChangeListener for Listener {
            fn on_entry_changed(&self, _fabric: FabricIndex) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let registry = FabricRegistry::new();
        let listener = Arc::new(Listener(AtomicUsize::new(0)));
        registry.add_listener(listener.clone());

        let fabric = registry.commit_fabric();
        registry.create_entry(AclEntry::case_admin(fabric)).unwrap();
        registry.delete_entries_for_fabric(fabric).unwrap();
        assert_eq!(listener.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn session_counters_drive_activity_checks() {
        let registry = FabricRegistry::new();
        let fabric = registry.commit_fabric();
        assert!(!registry.has_active_sessions(fabric));

        registry.session_started(fabric);
        assert!(registry.has_active_sessions(fabric));
        registry.session_ended(fabric);
        assert!(!registry.has_active_sessions(fabric));

        registry.subscription_started(fabric);
        assert!(registry.has_active_subscription(fabric));
        registry.subscription_ended(fabric);
        assert!(!registry.has_active_subscription(fabric));
    }

    #[test]
    fn case_admin_entry_shape() {
        let entry = AclEntry::case_admin(FabricIndex(3));
        assert_eq!(entry.subjects, vec![CASE_ADMIN_SUBJECT_ID]);
        assert_eq!(entry.privilege, Privilege::Administer);
        assert_eq!(entry.auth_mode, AuthMode::Case);
    }
}
