//! Inbound mail: the raw message type and the sources that yield it.

mod message;
mod source;

pub use message::{AttachmentRef, RawMessage};
pub use source::{MailSource, SpoolDirSource};
