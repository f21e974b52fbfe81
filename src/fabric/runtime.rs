//! Wiring of the fabric control plane: one runtime object owning the
//! registry, the capacity guard, the ACL bootstrap and the wipe latch.
//!
//! Event handlers receive this object by reference; there is no static
//! process-wide state, so tests can stand up independent instances.

use std::sync::Arc;

use log::{error, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::acl::{AclBootstrap, AclReportListener};
use super::guard::{CapacityGuard, SlotStatus};
use super::registry::FabricRegistry;
use super::services::{KeyValueStore, MatterContext};
use super::timer::{EvictionScheduler, TokioEvictionScheduler};
use super::types::{FabricError, FabricIndex};
use super::wipe::FullWipe;
use crate::app::AppEvent;
use crate::config::GuardConfig;

pub struct FabricRuntime {
    registry: Arc<FabricRegistry>,
    ctx: MatterContext,
    guard: Mutex<CapacityGuard>,
    wipe: FullWipe,
}

impl FabricRuntime {
    /// Build the control plane and register the ACL delegate/listener.
    ///
    /// Also re-seeds ACL entries for any fabric that existed before this
    /// boot, covering commit events missed across a crash.
    pub fn new(
        config: &GuardConfig,
        kv_store: Arc<dyn KeyValueStore>,
        events: mpsc::Sender<AppEvent>,
    ) -> Arc<Self> {
        let registry = Arc::new(FabricRegistry::new());
        let scheduler: Arc<dyn EvictionScheduler> = TokioEvictionScheduler::new(events);
        Self::with_parts(config, registry, scheduler, kv_store)
    }

    pub fn with_parts(
        config: &GuardConfig,
        registry: Arc<FabricRegistry>,
        scheduler: Arc<dyn EvictionScheduler>,
        kv_store: Arc<dyn KeyValueStore>,
    ) -> Arc<Self> {
        let ctx = MatterContext {
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
            kv_store,
            server: registry.clone(),
        };

        let bootstrap = AclBootstrap::new(ctx.access_control.clone(), ctx.reporting.clone());
        ctx.access_control
            .add_listener(Arc::new(AclReportListener::new(ctx.reporting.clone())));
        ctx.fabrics
            .add_delegate(Arc::new(bootstrap.clone().into_delegate()));
        bootstrap.seed_existing_fabrics(ctx.fabrics.as_ref());

        let guard = CapacityGuard::new(ctx.clone(), scheduler, config);

        Arc::new(Self {
            registry,
            ctx,
            guard: Mutex::new(guard),
            wipe: FullWipe::new(),
        })
    }

    /// The device's control-plane bookkeeping, for stack event reporting.
    pub fn registry(&self) -> &Arc<FabricRegistry> {
        &self.registry
    }

    pub fn context(&self) -> &MatterContext {
        &self.ctx
    }

    /// Commissioning-window-opened callback.
    pub fn on_commissioning_window_opened(&self) -> bool {
        self.request_free_slot()
    }

    /// Session-establishment-started callback. Also fired on each stack
    /// poll while the window is open, since the runtime surfaces no
    /// session event; `ensure_free_slot` is idempotent under that.
    pub fn on_commissioning_session_started(&self) {
        self.request_free_slot();
    }

    /// Externally observed commissioning completion: close the window
    /// mirror and commit the fabric record, firing the ACL bootstrap
    /// delegate.
    pub fn on_commissioning_complete(&self) -> FabricIndex {
        self.ctx.comm_window.close_window();
        self.registry.commit_fabric()
    }

    /// Fold a commissioning persisted before this boot into the registry.
    /// The runtime exposes only a commissioned flag, so a single record
    /// stands for it. Idempotent.
    pub fn mirror_persisted_commissioning(&self) {
        if self.ctx.fabrics.fabric_count() == 0 {
            let fabric = self.registry.commit_fabric();
            info!("Mirrored persisted commissioning as fabric {fabric}");
        }
    }

    /// Non-fatal slot request; `NoSlotAvailable` only logs (commissioning
    /// proceeds under the stack's own fallback rules).
    pub fn request_free_slot(&self) -> bool {
        match self.guard.lock().ensure_free_slot(None) {
            Ok(SlotStatus::Available) => true,
            Ok(SlotStatus::EvictionScheduled(victim)) => {
                info!("Eviction of idle fabric {victim} scheduled to free a slot");
                true
            }
            Err(FabricError::NoSlotAvailable) => false,
            Err(err) => {
                warn!("Fabric slot check failed: {err}");
                false
            }
        }
    }

    /// Deferred-eviction timer expiry, delivered via the app event queue.
    pub fn handle_eviction_due(&self, victim: FabricIndex) {
        self.guard.lock().on_eviction_due(victim);
    }

    /// Full factory wipe; the first error is logged, never propagated.
    pub fn factory_reset(&self) {
        if let Err(err) = self.wipe.run(&self.ctx) {
            error!("Full Matter wipe reported: {err}");
        }
    }

    pub fn is_wiping(&self) -> bool {
        self.wipe.is_in_progress()
    }

    /// Open the initial commissioning window when no fabric is provisioned.
    pub fn open_commissioning_window_if_needed(&self, timeout: std::time::Duration) {
        if self.ctx.fabrics.fabric_count() > 0 {
            return;
        }

        if !self.on_commissioning_window_opened() {
            warn!("Unable to free fabric slot before commissioning window");
            return;
        }

        if let Err(err) = self.ctx.comm_window.open_basic_window(timeout) {
            warn!("Opening basic commissioning window failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::services::{AccessControl, CommissioningWindowManager, FabricTable};
    use crate::fabric::timer::testing::RecordingScheduler;
    use crate::storage::FileKvStore;
    use std::time::Duration;

    fn make_runtime() -> (Arc<FabricRuntime>, Arc<RecordingScheduler>) {
        let registry = Arc::new(FabricRegistry::new());
        let scheduler = Arc::new(RecordingScheduler::default());
        let runtime = FabricRuntime::with_parts(
            &GuardConfig {
                max_fabrics: 2,
                eviction_grace_secs: 60,
                eviction_retry_secs: 10,
            },
            registry,
            scheduler.clone(),
            FileKvStore::in_memory(),
        );
        (runtime, scheduler)
    }

    #[test]
    fn commit_seeds_admin_entry_through_delegate() {
        let (runtime, _) = make_runtime();
        let fabric = runtime.registry().commit_fabric();
        assert_eq!(runtime.registry().entry_count(fabric), Ok(1));
    }

    #[test]
    fn window_open_at_boot_only_when_unprovisioned() {
        let (runtime, _) = make_runtime();
        runtime.open_commissioning_window_if_needed(Duration::from_secs(900));
        assert!(runtime.registry().is_window_open());

        let (provisioned, _) = make_runtime();
        provisioned.registry().commit_fabric();
        provisioned.open_commissioning_window_if_needed(Duration::from_secs(900));
        assert!(!provisioned.registry().is_window_open());
    }

    #[test]
    fn commissioning_complete_closes_window_and_seeds_acl() {
        let (runtime, _) = make_runtime();
        runtime.open_commissioning_window_if_needed(Duration::from_secs(900));
        assert!(runtime.registry().is_window_open());

        let fabric = runtime.on_commissioning_complete();
        assert!(!runtime.registry().is_window_open());
        assert_eq!(runtime.registry().fabric_count(), 1);
        assert_eq!(runtime.registry().entry_count(fabric), Ok(1));
    }

    #[test]
    fn persisted_commissioning_is_mirrored_once() {
        let (runtime, _) = make_runtime();
        runtime.mirror_persisted_commissioning();
        runtime.mirror_persisted_commissioning();
        assert_eq!(runtime.registry().fabric_count(), 1);

        // The mirrored record is ACL-seeded like a live commit.
        let fabric = runtime.registry().fabrics()[0];
        assert_eq!(runtime.registry().entry_count(fabric), Ok(1));
    }

    #[test]
    fn session_start_at_capacity_schedules_eviction() {
        let (runtime, scheduler) = make_runtime();
        let f1 = runtime.registry().commit_fabric();
        runtime.registry().commit_fabric();

        runtime.on_commissioning_session_started();
        assert_eq!(scheduler.outstanding(), Some(f1));

        // Re-fired on the next poll: the pending eviction is not re-armed.
        runtime.on_commissioning_session_started();
        assert_eq!(scheduler.armed_victims(), vec![f1]);
    }

    #[test]
    fn eviction_event_round_trip() {
        let (runtime, scheduler) = make_runtime();
        let f1 = runtime.registry().commit_fabric();
        runtime.registry().commit_fabric();

        assert!(runtime.request_free_slot());
        assert_eq!(scheduler.outstanding(), Some(f1));

        runtime.handle_eviction_due(f1);
        assert_eq!(runtime.registry().fabric_count(), 1);
    }

    #[test]
    fn factory_reset_is_latched() {
        let (runtime, _) = make_runtime();
        runtime.registry().commit_fabric();
        runtime.factory_reset();
        assert!(runtime.is_wiping());
        assert_eq!(runtime.registry().fabric_count(), 0);
    }
}
