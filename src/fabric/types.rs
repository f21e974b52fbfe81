//! Core identifiers and records for the fabric control plane.

use thiserror::Error as ThisError;

/// Index of a commissioned fabric in the fabric table (1..=capacity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FabricIndex(pub u8);

impl std::fmt::Display for FabricIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

/// Matter operational node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u64);

/// Subject granted administrative access on every freshly committed fabric.
///
/// Matches the reserved CASE admin subject the commissioner authenticates as.
pub const CASE_ADMIN_SUBJECT_ID: NodeId = NodeId(0x0000_0000_0000_0002);

/// Access privilege levels, most to least powerful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Administer,
    Manage,
    Operate,
    View,
    ProxyView,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Case,
    Group,
}

/// A single access-control rule scoped to one fabric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclEntry {
    pub fabric: FabricIndex,
    pub privilege: Privilege,
    pub auth_mode: AuthMode,
    pub subjects: Vec<NodeId>,
}

impl AclEntry {
    /// The default administrative entry seeded for a freshly committed fabric.
    pub fn case_admin(fabric: FabricIndex) -> Self {
        Self {
            fabric,
            privilege: Privilege::Administer,
            auth_mode: AuthMode::Case,
            subjects: vec![CASE_ADMIN_SUBJECT_ID],
        }
    }
}

/// Concrete attribute path used to mark report data dirty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributePath {
    pub endpoint: u16,
    pub cluster: u32,
    pub attribute: u32,
}

/// Access Control cluster id (endpoint 0).
pub const ACCESS_CONTROL_CLUSTER_ID: u32 = 0x001F;

/// Access Control attributes whose reads derive from the entry store.
pub const ACL_ATTRIBUTE_ID: u32 = 0x0000;
pub const SUBJECTS_PER_ENTRY_ATTRIBUTE_ID: u32 = 0x0002;
pub const TARGETS_PER_ENTRY_ATTRIBUTE_ID: u32 = 0x0003;
pub const ENTRIES_PER_FABRIC_ATTRIBUTE_ID: u32 = 0x0004;

/// Failures surfaced by the fabric control plane.
///
/// Only `NoSlotAvailable` is ever shown to a caller as a decision; store
/// errors are logged and retried or treated best-effort.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum FabricError {
    #[error("no fabric slot available and no idle fabric to evict")]
    NoSlotAvailable,

    #[error("fabric {0} not found")]
    NotFound(FabricIndex),

    #[error("store operation failed: {0}")]
    Store(String),
}

impl FabricError {
    /// Not-found results from delete-style operations are treated as success.
    pub fn is_benign_not_found(&self) -> bool {
        matches!(self, FabricError::NotFound(_))
    }
}
