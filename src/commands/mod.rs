//! Typed administrative command modules.
//!
//! Each struct implements [`AdminCommand`](crate::command::AdminCommand) and
//! maps its fields to the exact argv of one in-container tool.

pub mod fs;
pub mod http;
pub mod postgres;
pub mod redis;
