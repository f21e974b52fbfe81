//! Fabric lifecycle control plane: capacity guard, ACL bootstrap, full wipe.

pub mod acl;
pub mod guard;
pub mod registry;
pub mod runtime;
pub mod services;
pub mod timer;
pub mod types;
pub mod wipe;

pub use acl::AclBootstrap;
pub use guard::{CapacityGuard, SlotStatus};
pub use registry::FabricRegistry;
pub use runtime::FabricRuntime;
pub use services::MatterContext;
pub use types::{FabricError, FabricIndex, NodeId};
pub use wipe::FullWipe;
