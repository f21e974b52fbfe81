//! Fabric capacity guard.
//!
//! Keeps a fabric slot free whenever commissioning might complete, by
//! scheduling the eviction of at most one idle fabric. A fabric with any
//! active CASE session or subscription is never selected, and the fabric
//! currently opening the commissioning window is protected even when idle.
//!
//! Eviction is deferred through a cancelable timer so an in-flight
//! low-priority exchange gets a grace window; on expiry the victim's
//! idleness is re-validated before anything is torn down.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use super::acl::notify_acl_changed;
use super::services::MatterContext;
use super::timer::EvictionScheduler;
use super::types::{FabricError, FabricIndex};
use crate::config::GuardConfig;

/// Outcome of a slot request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    /// Below capacity; nothing to do.
    Available,
    /// At capacity; an idle fabric's eviction timer is armed.
    EvictionScheduled(FabricIndex),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingEviction {
    victim: FabricIndex,
    delay: Duration,
}

/// Explicit guard state owned by the server runtime, not process globals.
pub struct CapacityGuard {
    ctx: MatterContext,
    scheduler: Arc<dyn EvictionScheduler>,
    capacity: usize,
    grace: Duration,
    retry: Duration,
    pending: Option<PendingEviction>,
}

impl CapacityGuard {
    pub fn new(
        ctx: MatterContext,
        scheduler: Arc<dyn EvictionScheduler>,
        config: &GuardConfig,
    ) -> Self {
        Self {
            ctx,
            scheduler,
            capacity: config.max_fabrics,
            grace: config.eviction_grace(),
            retry: config.eviction_retry(),
            pending: None,
        }
    }

    /// Ensure a fabric slot will be free for an incoming commissioning.
    ///
    /// Below capacity this is a no-op. At capacity, the first idle
    /// non-protected fabric (lowest index wins among equals) gets a deferred
    /// eviction. `NoSlotAvailable` when every other fabric has live traffic;
    /// the caller may still proceed per the Matter fallback rules.
    pub fn ensure_free_slot(
        &mut self,
        protected: Option<FabricIndex>,
    ) -> Result<SlotStatus, FabricError> {
        if self.ctx.fabrics.fabric_count() < self.capacity {
            return Ok(SlotStatus::Available);
        }

        // The opener fabric is re-read at every invocation so a concurrent
        // commissioning attempt can never race an earlier snapshot.
        let protected = protected.or_else(|| self.ctx.comm_window.opener_fabric());

        let victim = self.select_victim(protected).ok_or_else(|| {
            info!("No fabric slots available and no idle fabric to evict");
            FabricError::NoSlotAvailable
        })?;

        match self.pending {
            Some(pending) if pending.victim == victim => {
                // Timer already armed for this victim; leave it running.
            }
            Some(_) => {
                self.scheduler.cancel();
                self.arm(victim, self.grace);
            }
            None => self.arm(victim, self.grace),
        }

        Ok(SlotStatus::EvictionScheduled(victim))
    }

    /// Timer callback: re-validate and evict, or push the retry out.
    pub fn on_eviction_due(&mut self, victim: FabricIndex) {
        match self.pending {
            Some(pending) if pending.victim == victim => {}
            _ => {
                // Stale fire from a timer canceled after dispatch.
                return;
            }
        }

        if !self.ctx.fabrics.fabrics().contains(&victim) {
            info!("Eviction victim {victim} already gone");
            self.pending = None;
            return;
        }

        if self.ctx.fabrics.fabric_count() < self.capacity {
            info!("Fabric slot freed elsewhere, dropping eviction of {victim}");
            self.pending = None;
            return;
        }

        let protected = self.ctx.comm_window.opener_fabric();
        if Some(victim) == protected || !self.is_idle(victim) {
            info!("Fabric {victim} no longer evictable, retrying later");
            self.arm(victim, self.retry);
            return;
        }

        match self.evict(victim) {
            Ok(()) => {
                info!("Evicted idle fabric {victim} to free a slot");
                self.pending = None;
            }
            Err(err) => {
                warn!("Failed to evict fabric {victim}: {err}, retrying");
                self.arm(victim, self.retry);
            }
        }
    }

    /// Victim under deferred eviction, if any.
    pub fn pending_victim(&self) -> Option<FabricIndex> {
        self.pending.map(|p| p.victim)
    }

    fn arm(&mut self, victim: FabricIndex, delay: Duration) {
        self.pending = Some(PendingEviction { victim, delay });
        self.scheduler.arm(victim, delay);
    }

    fn is_idle(&self, fabric: FabricIndex) -> bool {
        !self.ctx.sessions.has_active_sessions(fabric)
            && !self.ctx.subscriptions.has_active_subscription(fabric)
    }

    fn select_victim(&self, protected: Option<FabricIndex>) -> Option<FabricIndex> {
        let mut fabrics = self.ctx.fabrics.fabrics();
        fabrics.sort_unstable();
        fabrics
            .into_iter()
            .filter(|fabric| Some(*fabric) != protected)
            .find(|fabric| self.is_idle(*fabric))
    }

    /// Cascade delete: sessions, resumption cache, group data and ACL
    /// entries go before the fabric record itself.
    fn evict(&self, victim: FabricIndex) -> Result<(), FabricError> {
        self.ctx.sessions.expire_sessions_for_fabric(victim);
        self.ctx.case_sessions.release_sessions_for_fabric(victim);

        if let Err(err) = self.ctx.resumption.delete_all(victim)
            && !err.is_benign_not_found()
        {
            return Err(err);
        }
        if let Err(err) = self.ctx.groups.remove_fabric(victim)
            && !err.is_benign_not_found()
        {
            return Err(err);
        }
        if let Err(err) = self.ctx.access_control.delete_entries_for_fabric(victim)
            && !err.is_benign_not_found()
        {
            return Err(err);
        }
        notify_acl_changed(self.ctx.reporting.as_ref());

        match self.ctx.fabrics.delete(victim) {
            Ok(()) => Ok(()),
            Err(err) if err.is_benign_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::acl::AclBootstrap;
    use crate::fabric::registry::FabricRegistry;
    use crate::fabric::services::{AccessControl, FabricTable};
    use crate::fabric::timer::testing::RecordingScheduler;
    use crate::fabric::types::AclEntry;
    use rand::prelude::*;

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

    fn guard_with_capacity(
        registry: &Arc<FabricRegistry>,
        scheduler: &Arc<RecordingScheduler>,
        capacity: usize,
    ) -> CapacityGuard {
        let config = GuardConfig {
            max_fabrics: capacity,
            eviction_grace_secs: 60,
            eviction_retry_secs: 10,
        };
        CapacityGuard::new(context(registry), scheduler.clone(), &config)
    }

    #[test]
    fn below_capacity_is_a_noop() {
        let registry = Arc::new(FabricRegistry::new());
        let scheduler = Arc::new(RecordingScheduler::default());
        let mut guard = guard_with_capacity(&registry, &scheduler, 5);

        registry.commit_fabric();
        assert_eq!(guard.ensure_free_slot(None), Ok(SlotStatus::Available));
        assert!(scheduler.calls.lock().is_empty());
        assert_eq!(guard.pending_victim(), None);
    }

    #[test]
    fn at_capacity_schedules_first_idle_fabric() {
        let registry = Arc::new(FabricRegistry::new());
        let scheduler = Arc::new(RecordingScheduler::default());
        let mut guard = guard_with_capacity(&registry, &scheduler, 2);

        let f1 = registry.commit_fabric();
        let _f2 = registry.commit_fabric();

        assert_eq!(
            guard.ensure_free_slot(None),
            Ok(SlotStatus::EvictionScheduled(f1))
        );
        assert_eq!(scheduler.outstanding(), Some(f1));
        // Nothing deleted until the timer fires.
        assert_eq!(registry.fabric_count(), 2);
    }

    #[test]
    fn busy_fabrics_are_never_selected() {
        let registry = Arc::new(FabricRegistry::new());
        let scheduler = Arc::new(RecordingScheduler::default());
        let mut guard = guard_with_capacity(&registry, &scheduler, 2);

        let f1 = registry.commit_fabric();
        let f2 = registry.commit_fabric();
        registry.session_started(f1);
        registry.subscription_started(f2);

        assert_eq!(
            guard.ensure_free_slot(None),
            Err(FabricError::NoSlotAvailable)
        );
        assert!(scheduler.calls.lock().is_empty());
    }

    #[test]
    fn eviction_safety_holds_for_random_configurations() {
        let mut rng = StdRng::seed_from_u64(0x5011);

        for _ in 0..200 {
            let registry = Arc::new(FabricRegistry::new());
            let scheduler = Arc::new(RecordingScheduler::default());
            let fabric_count = rng.gen_range(1..=6);
            let mut guard = guard_with_capacity(&registry, &scheduler, fabric_count);

            let mut busy = Vec::new();
            for _ in 0..fabric_count {
                let fabric = registry.commit_fabric();
                let has_session = rng.gen_bool(0.4);
                let has_subscription = rng.gen_bool(0.4);
                if has_session {
                    registry.session_started(fabric);
                }
                if has_subscription {
                    registry.subscription_started(fabric);
                }
                if has_session || has_subscription {
                    busy.push(fabric);
                }
            }

            match guard.ensure_free_slot(None) {
                Ok(SlotStatus::EvictionScheduled(victim)) => {
                    assert!(!busy.contains(&victim), "busy fabric {victim} selected");
                }
                Ok(SlotStatus::Available) => unreachable!("table is at capacity"),
                Err(FabricError::NoSlotAvailable) => {
                    assert_eq!(busy.len(), fabric_count, "idle fabric missed");
                }
                Err(other) => panic!("unexpected error {other}"),
            }
        }
    }

    #[test]
    fn protected_fabric_is_never_selected() {
        let registry = Arc::new(FabricRegistry::new());
        let scheduler = Arc::new(RecordingScheduler::default());
        let mut guard = guard_with_capacity(&registry, &scheduler, 2);

        let f1 = registry.commit_fabric();
        let f2 = registry.commit_fabric();

        // Both idle; protecting f1 must push selection to f2.
        assert_eq!(
            guard.ensure_free_slot(Some(f1)),
            Ok(SlotStatus::EvictionScheduled(f2))
        );

        // Same when the protection comes from the window opener.
        let scheduler2 = Arc::new(RecordingScheduler::default());
        let mut guard2 = guard_with_capacity(&registry, &scheduler2, 2);
        registry.set_window_opener(Some(f1));
        assert_eq!(
            guard2.ensure_free_slot(None),
            Ok(SlotStatus::EvictionScheduled(f2))
        );
    }

    #[test]
    fn new_victim_cancels_pending_timer() {
        let registry = Arc::new(FabricRegistry::new());
        let scheduler = Arc::new(RecordingScheduler::default());
        let mut guard = guard_with_capacity(&registry, &scheduler, 2);

        let f1 = registry.commit_fabric();
        let f2 = registry.commit_fabric();

        assert_eq!(
            guard.ensure_free_slot(None),
            Ok(SlotStatus::EvictionScheduled(f1))
        );

        // f1 becomes busy; the next request must switch to f2 and cancel
        // f1's timer.
        registry.session_started(f1);
        assert_eq!(
            guard.ensure_free_slot(None),
            Ok(SlotStatus::EvictionScheduled(f2))
        );
        assert_eq!(scheduler.outstanding(), Some(f2));
        assert_eq!(guard.pending_victim(), Some(f2));
    }

    #[test]
    fn repeated_request_for_same_victim_keeps_single_timer() {
        let registry = Arc::new(FabricRegistry::new());
        let scheduler = Arc::new(RecordingScheduler::default());
        let mut guard = guard_with_capacity(&registry, &scheduler, 1);

        let f1 = registry.commit_fabric();
        guard.ensure_free_slot(None).unwrap();
        guard.ensure_free_slot(None).unwrap();
        assert_eq!(scheduler.armed_victims(), vec![f1]);
    }

    #[test]
    fn timer_fire_evicts_idle_victim_with_cascade() {
        let registry = Arc::new(FabricRegistry::new());
        let scheduler = Arc::new(RecordingScheduler::default());
        let mut guard = guard_with_capacity(&registry, &scheduler, 1);

        let f1 = registry.commit_fabric();
        registry.create_entry(AclEntry::case_admin(f1)).unwrap();

        guard.ensure_free_slot(None).unwrap();
        guard.on_eviction_due(f1);

        assert_eq!(registry.fabric_count(), 0);
        assert_eq!(registry.entry_count(f1), Ok(0));
        assert_eq!(guard.pending_victim(), None);
        // ACL change was reported.
        assert!(!registry.dirty_paths().is_empty());
    }

    #[test]
    fn timer_fire_reschedules_when_victim_became_active() {
        let registry = Arc::new(FabricRegistry::new());
        let scheduler = Arc::new(RecordingScheduler::default());
        let mut guard = guard_with_capacity(&registry, &scheduler, 1);

        let f1 = registry.commit_fabric();
        guard.ensure_free_slot(None).unwrap();

        registry.subscription_started(f1);
        guard.on_eviction_due(f1);

        // Victim survives and the retry timer is armed with the shorter delay.
        assert_eq!(registry.fabric_count(), 1);
        assert_eq!(guard.pending_victim(), Some(f1));
        let calls = scheduler.calls.lock().clone();
        match calls.last() {
            Some(crate::fabric::timer::testing::SchedulerCall::Arm(victim, delay)) => {
                assert_eq!(*victim, f1);
                assert_eq!(*delay, Duration::from_secs(10));
            }
            other => panic!("expected retry arm, got {other:?}"),
        }
    }

    #[test]
    fn stale_timer_fire_is_ignored() {
        let registry = Arc::new(FabricRegistry::new());
        let scheduler = Arc::new(RecordingScheduler::default());
        let mut guard = guard_with_capacity(&registry, &scheduler, 2);

        let f1 = registry.commit_fabric();
        registry.commit_fabric();

        // No pending eviction; a late fire must not delete anything.
        guard.on_eviction_due(f1);
        assert_eq!(registry.fabric_count(), 2);
    }

    #[test]
    fn commissioning_scenario_keeps_count_at_capacity() {
        // capacity=2, idle F1/F2 committed, F3 commissioning begins.
        let registry = Arc::new(FabricRegistry::new());
        let scheduler = Arc::new(RecordingScheduler::default());
        let mut guard = guard_with_capacity(&registry, &scheduler, 2);
        let bootstrap = AclBootstrap::new(registry.clone(), registry.clone());
        registry.add_delegate(Arc::new(bootstrap.clone().into_delegate()));

        let f1 = registry.commit_fabric();
        let _f2 = registry.commit_fabric();

        // Window opens for F3; no opener id yet, so nothing is protected.
        assert_eq!(
            guard.ensure_free_slot(None),
            Ok(SlotStatus::EvictionScheduled(f1))
        );
        guard.on_eviction_due(f1);
        assert_eq!(registry.fabric_count(), 1);

        // F3 commits; the delegate seeds its admin entry.
        let f3 = registry.commit_fabric();
        assert_eq!(registry.entry_count(f3), Ok(1));
        assert_eq!(registry.fabric_count(), 2);
    }
}
