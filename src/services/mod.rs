//! View lookup and per-socket frame routing.

pub mod registry;
pub mod router;

pub use registry::ViewRegistry;
pub use router::MessageRouter;
