//! Built-in [`RequestProcessor`](crate::dispatch::RequestProcessor)s.

pub mod command;
pub mod hash;

pub use command::ExternalCommandProcessor;
pub use hash::{ContentHashProcessor, HashAlgorithm};
