//! Boundaries to the metadata and master services.
mod allocator;
mod meta_client;

pub use allocator::AllocateError;
pub use allocator::ExtentAllocator;
pub use meta_client::MasterClient;
pub use meta_client::MasterError;
pub use meta_client::MetaClient;
pub use meta_client::MetaError;

pub(crate) use allocator::PartitionExtentAllocator;
