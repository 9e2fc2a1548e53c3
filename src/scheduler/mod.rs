//! Request state and the active request directory.

mod directory;
mod request;

pub use directory::{RequestDirectory, SequenceIdAllocator};
pub use request::{Request, RequestId};
