//! ACL bootstrap: every committed fabric gets a working admin entry.
//!
//! Commissioners are supposed to write their own ACL during commissioning,
//! but a failed or interrupted flow can leave a fabric with no entries at
//! all, locking the commissioner out. The bootstrap seeds a single CASE
//! Administer entry for the reserved admin subject whenever a fabric commits
//! with an empty entry list. It never overwrites or duplicates entries.

use std::sync::Arc;

use log::{error, info};

use super::services::{
    AccessControl, AclChangeListener, FabricDelegate, FabricTable, ReportingEngine,
};
use super::types::{
    ACCESS_CONTROL_CLUSTER_ID, ACL_ATTRIBUTE_ID, AclEntry, AttributePath,
    ENTRIES_PER_FABRIC_ATTRIBUTE_ID, FabricError, FabricIndex, SUBJECTS_PER_ENTRY_ATTRIBUTE_ID,
    TARGETS_PER_ENTRY_ATTRIBUTE_ID,
};

/// Mark the ACL-derived Access Control attributes dirty so active
/// subscribers are told. Side-effect only; safe to call redundantly.
pub fn notify_acl_changed(reporting: &dyn ReportingEngine) {
    const PATHS: [AttributePath; 4] = [
        AttributePath {
            endpoint: 0,
            cluster: ACCESS_CONTROL_CLUSTER_ID,
            attribute: ACL_ATTRIBUTE_ID,
        },
        AttributePath {
            endpoint: 0,
            cluster: ACCESS_CONTROL_CLUSTER_ID,
            attribute: ENTRIES_PER_FABRIC_ATTRIBUTE_ID,
        },
        AttributePath {
            endpoint: 0,
            cluster: ACCESS_CONTROL_CLUSTER_ID,
            attribute: SUBJECTS_PER_ENTRY_ATTRIBUTE_ID,
        },
        AttributePath {
            endpoint: 0,
            cluster: ACCESS_CONTROL_CLUSTER_ID,
            attribute: TARGETS_PER_ENTRY_ATTRIBUTE_ID,
        },
    ];

    for path in PATHS {
        reporting.set_dirty(path);
    }
}

/// Seeds default admin ACL entries for committed fabrics.
#[derive(Clone)]
pub struct AclBootstrap {
    access_control: Arc<dyn AccessControl>,
    reporting: Arc<dyn ReportingEngine>,
}

impl AclBootstrap {
    pub fn new(access_control: Arc<dyn AccessControl>, reporting: Arc<dyn ReportingEngine>) -> Self {
        Self {
            access_control,
            reporting,
        }
    }

    /// Idempotent: a fabric that already has entries is left untouched,
    /// which keeps repeated commit events from growing the ACL unbounded.
    ///
    /// Failures are logged and not retried; a missing entry surfaces as
    /// access-denied on the commissioner side rather than a local fault.
    pub fn on_fabric_committed(&self, fabric: FabricIndex) -> Result<(), FabricError> {
        let entry_count = self.access_control.entry_count(fabric).map_err(|err| {
            error!("ACL seed: failed to get entry count for fabric {fabric}: {err}");
            err
        })?;

        if entry_count > 0 {
            return Ok(());
        }

        let index = self
            .access_control
            .create_entry(AclEntry::case_admin(fabric))
            .map_err(|err| {
                error!("ACL seed: create entry failed for fabric {fabric}: {err}");
                err
            })?;

        info!("ACL seed: created CASE Admin entry for fabric {fabric} (ACL index {index})");
        notify_acl_changed(self.reporting.as_ref());
        Ok(())
    }

    /// Seed every existing fabric; recovers commit events missed across a
    /// crash or reboot. Per-fabric failures are logged and skipped.
    pub fn seed_existing_fabrics(&self, fabrics: &dyn FabricTable) {
        for fabric in fabrics.fabrics() {
            if let Err(err) = self.on_fabric_committed(fabric) {
                error!("ACL seed failed for fabric {fabric}: {err}");
            }
        }
    }

    /// Wrap into the fabric table's post-commit delegate.
    pub fn into_delegate(self) -> AclSeedDelegate {
        AclSeedDelegate { bootstrap: self }
    }
}

/// Fabric-table delegate seeding the admin entry after each commit.
pub struct AclSeedDelegate {
    bootstrap: AclBootstrap,
}

impl FabricDelegate for AclSeedDelegate {
    fn on_fabric_committed(&self, fabric: FabricIndex) {
        if let Err(err) = self.bootstrap.on_fabric_committed(fabric) {
            error!("ACL seed: failed for fabric {fabric}: {err}");
        }
    }
}

/// Entry listener forwarding every ACL change to the reporting engine.
pub struct AclReportListener {
    reporting: Arc<dyn ReportingEngine>,
}

impl AclReportListener {
    pub fn new(reporting: Arc<dyn ReportingEngine>) -> Self {
        Self { reporting }
    }
}

impl AclChangeListener for AclReportListener {
    fn on_entry_changed(&self, _fabric: FabricIndex) {
        notify_acl_changed(self.reporting.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::registry::FabricRegistry;
    use crate::fabric::types::{AuthMode, CASE_ADMIN_SUBJECT_ID, Privilege};

    #[test]
    fn bootstrap_is_idempotent() {
        let registry = Arc::new(FabricRegistry::new());
        let bootstrap = AclBootstrap::new(registry.clone(), registry.clone());
        let fabric = registry.commit_fabric();

        bootstrap.on_fabric_committed(fabric).unwrap();
        let after_first = registry.entry_count(fabric).unwrap();

        bootstrap.on_fabric_committed(fabric).unwrap();
        let after_second = registry.entry_count(fabric).unwrap();

        assert_eq!(after_first, 1);
        assert_eq!(after_second, after_first);
    }

    #[test]
    fn seeded_entry_grants_case_admin() {
        let registry = Arc::new(FabricRegistry::new());
        let bootstrap = AclBootstrap::new(registry.clone(), registry.clone());
        let fabric = registry.commit_fabric();

        bootstrap.on_fabric_committed(fabric).unwrap();
        let entries = registry.acl_entries(fabric);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].privilege, Privilege::Administer);
        assert_eq!(entries[0].auth_mode, AuthMode::Case);
        assert_eq!(entries[0].subjects, vec![CASE_ADMIN_SUBJECT_ID]);
    }

    #[test]
    fn existing_entries_are_never_overwritten() {
        let registry = Arc::new(FabricRegistry::new());
        let bootstrap = AclBootstrap::new(registry.clone(), registry.clone());
        let fabric = registry.commit_fabric();

        let mut custom = AclEntry::case_admin(fabric);
        custom.privilege = Privilege::Manage;
        registry.create_entry(custom.clone()).unwrap();

        bootstrap.on_fabric_committed(fabric).unwrap();
        let entries = registry.acl_entries(fabric);
        assert_eq!(entries, vec![custom]);
    }

    #[test]
    fn seed_existing_covers_all_fabrics() {
        let registry = Arc::new(FabricRegistry::new());
        let bootstrap = AclBootstrap::new(registry.clone(), registry.clone());
        let f1 = registry.commit_fabric();
        let f2 = registry.commit_fabric();

        bootstrap.seed_existing_fabrics(registry.as_ref());
        assert_eq!(registry.entry_count(f1).unwrap(), 1);
        assert_eq!(registry.entry_count(f2).unwrap(), 1);
    }

    #[test]
    fn notify_marks_all_four_paths() {
        let registry = Arc::new(FabricRegistry::new());
        notify_acl_changed(registry.as_ref());
        let paths = registry.dirty_paths();
        assert_eq!(paths.len(), 4);
        assert!(paths.iter().all(|p| p.cluster == ACCESS_CONTROL_CLUSTER_ID));
        assert!(paths.iter().all(|p| p.endpoint == 0));
    }
}
