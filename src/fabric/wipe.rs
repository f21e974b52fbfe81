//! Full Matter wipe: return the device to its out-of-box state.
//!
//! Teardown order matters: sessions and the commissioning window go first,
//! then each fabric's cascading state, then the persisted stores. Every
//! sub-step is best-effort; the first error is collected for diagnostics
//! but the pass always runs to completion.

use std::sync::atomic::{AtomicBool, Ordering};

use log::{info, warn};

use super::acl::notify_acl_changed;
use super::services::MatterContext;
use super::types::FabricError;

/// One-shot wipe of all commissioning state.
///
/// The latch makes a second trigger a no-op, so a duplicate platform event
/// cannot start a re-entrant wipe.
#[derive(Default)]
pub struct FullWipe {
    in_progress: AtomicBool,
}

impl FullWipe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the wipe. Returns the first error encountered, for diagnostics
    /// only; the wipe is considered complete either way. Not cancelable.
    pub fn run(&self, ctx: &MatterContext) -> Result<(), FabricError> {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            info!("Factory wipe already in progress, ignoring trigger");
            return Ok(());
        }

        let mut first_error: Option<FabricError> = None;
        fn record(slot: &mut Option<FabricError>, err: FabricError) {
            if slot.is_none() {
                *slot = Some(err);
            }
        }

        ctx.fail_safe.force_fail_safe_expiry();
        ctx.comm_window.close_window();
        ctx.case_sessions.release_all_sessions();
        ctx.sessions.expire_all_sessions();

        for fabric in ctx.fabrics.fabrics() {
            ctx.sessions.expire_sessions_for_fabric(fabric);
            ctx.case_sessions.release_sessions_for_fabric(fabric);

            if let Err(err) = ctx.resumption.delete_all(fabric)
                && !err.is_benign_not_found()
            {
                warn!("Failed to clear resumption cache for fabric {fabric}: {err}");
                record(&mut first_error, err);
            }

            if let Err(err) = ctx.groups.remove_fabric(fabric)
                && !err.is_benign_not_found()
            {
                warn!("Failed to remove group data for fabric {fabric}: {err}");
                record(&mut first_error, err);
            }

            if let Err(err) = ctx.access_control.delete_entries_for_fabric(fabric)
                && !err.is_benign_not_found()
            {
                warn!("Failed to delete ACL entries for fabric {fabric}: {err}");
                record(&mut first_error, err);
            }

            if let Err(err) = ctx.fabrics.delete(fabric)
                && !err.is_benign_not_found()
            {
                warn!("Fabric delete failed for {fabric}: {err}");
                record(&mut first_error, err);
            }
        }

        if let Err(err) = ctx.access_control.reset_to_default() {
            warn!("Access control reset failed: {err}");
            record(&mut first_error, err);
        }
        notify_acl_changed(ctx.reporting.as_ref());

        ctx.server.shutdown();

        if let Err(err) = ctx.kv_store.factory_reset() {
            warn!("KeyValueStore factory reset failed: {err}");
            record(&mut first_error, err);
        }

        ctx.server.destroy_event_logging();
        ctx.fail_safe.disarm_fail_safe();
        ctx.server.schedule_settings_flush();

        info!("Full Matter wipe completed");

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuardConfig;
    use crate::fabric::guard::{CapacityGuard, SlotStatus};
    use crate::fabric::registry::FabricRegistry;
    use crate::fabric::services::{AccessControl, FabricTable, KeyValueStore};
    use crate::fabric::timer::testing::RecordingScheduler;
    use crate::fabric::types::AclEntry;
    use std::sync::Arc;

    fn context(registry: &Arc<FabricRegistry>) -> MatterContext {
        MatterContext {
            fabrics: registry.clone(),
            sessions: registry.clone(),
            case_sessions: registry.clone(),
            subscriptions: registry.clone(),
            resumption: registry.clone(),
            groups: registry.clone(),
            access_control: registry.clone(),
            reporting: registry.clone(),
            comm_window: registry.clone(),
            fail_safe: registry.clone(),
            kv_store: crate::storage::FileKvStore::in_memory(),
            server: registry.clone(),
        }
    }

    #[test]
    fn wipe_clears_fabrics_acl_and_storage() {
        let registry = Arc::new(FabricRegistry::new());
        let ctx = context(&registry);

        let f1 = registry.commit_fabric();
        let f2 = registry.commit_fabric();
        registry.create_entry(AclEntry::case_admin(f1)).unwrap();
        registry.create_entry(AclEntry::case_admin(f2)).unwrap();
        registry.session_started(f1);
        ctx.kv_store.put("soil.gendiag.rebootcnt", &[1, 0]).unwrap();
        registry.arm_fail_safe();

        let wipe = FullWipe::new();
        wipe.run(&ctx).unwrap();

        assert_eq!(registry.fabric_count(), 0);
        assert_eq!(registry.entry_count(f1), Ok(0));
        assert_eq!(registry.entry_count(f2), Ok(0));
        assert!(ctx.kv_store.get("soil.gendiag.rebootcnt").is_none());
        assert!(registry.is_shut_down());
        assert!(!registry.is_fail_safe_armed());
    }

    #[test]
    fn second_trigger_is_a_noop() {
        let registry = Arc::new(FabricRegistry::new());
        let ctx = context(&registry);
        let wipe = FullWipe::new();

        wipe.run(&ctx).unwrap();
        let fabric = registry.commit_fabric();

        // Latched: the new fabric survives the duplicate trigger.
        wipe.run(&ctx).unwrap();
        assert_eq!(registry.fabrics(), vec![fabric]);
    }

    #[test]
    fn ensure_free_slot_succeeds_trivially_after_wipe() {
        let registry = Arc::new(FabricRegistry::new());
        let ctx = context(&registry);

        for _ in 0..2 {
            registry.commit_fabric();
        }

        FullWipe::new().run(&ctx).unwrap();

        let scheduler = Arc::new(RecordingScheduler::default());
        let config = GuardConfig {
            max_fabrics: 2,
            eviction_grace_secs: 60,
            eviction_retry_secs: 10,
        };
        let mut guard = CapacityGuard::new(context(&registry), scheduler, &config);
        assert_eq!(guard.ensure_free_slot(None), Ok(SlotStatus::Available));
    }
}
