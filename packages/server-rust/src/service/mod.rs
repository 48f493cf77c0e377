//! Route registry and the dispatch pipeline.
//!
//! 1. **Registry** (`registry`): per-route options normalized once into
//!    `ServiceRecord { processor, transport, protocol }`
//! 2. **Dispatch** (`dispatch`): runs a record's processor over buffered
//!    bytes, committing or rolling back the read position

pub mod dispatch;
pub mod registry;

pub use dispatch::{dispatch_all, dispatch_one, DispatchError, Dispatched};
pub use registry::{
    normalize, ProcessorSource, RegistryError, ServiceOptions, ServiceRecord, ServiceRegistry,
};
