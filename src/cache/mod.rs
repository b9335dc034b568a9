mod extent_cache;

pub use extent_cache::CacheError;
pub use extent_cache::CacheSegment;
pub use extent_cache::ExtentCache;
pub use extent_cache::ExtentDescriptor;
