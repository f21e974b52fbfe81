mod netif;
mod stack;

pub mod clusters;
pub mod device_types;

pub use stack::run_matter_stack;
