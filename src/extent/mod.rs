//! Per-extent write and read sessions, their pipelines and recovery, and the per-file stream that
//! drives them.
mod extent_stream;
mod pipeline;
mod reader;
mod retry;
mod stream_context;
mod worker_pool;
mod writer;

pub use extent_stream::ExtentStream;
pub use extent_stream::StreamError;
pub use reader::ReaderCreateError;
pub use writer::FlushError;
pub use writer::WriterCreateError;

pub(crate) use pipeline::SessionState;
pub(crate) use reader::ExtentReader;
pub(crate) use retry::do_extent_request;
pub(crate) use retry::ExtentRequestError;
pub(crate) use stream_context::ClientShared;
pub(crate) use stream_context::SessionOptions;
pub(crate) use stream_context::StreamContext;
pub(crate) use worker_pool::WorkerPool;
pub(crate) use writer::ExtentWriter;
