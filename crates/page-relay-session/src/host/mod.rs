//! Remote host implementations.

#[cfg(feature = "scripted")]
pub mod scripted;

#[cfg(feature = "scripted")]
pub use scripted::{ContentModel, PageModel, ScriptReply, ScriptedHost};
