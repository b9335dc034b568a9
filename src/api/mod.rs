//! Client-facing API: options, wiring and the client handle.
mod client;
mod options;
mod wiring;

pub use client::ExtentClient;
pub use options::ExtentClientOptions;
pub use wiring::try_create_extent_client;
pub use wiring::ExtentClientConfig;
pub use wiring::ExtentClientCreationError;
