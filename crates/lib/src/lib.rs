//! Chatreply core library: relays input lines to a chat provider and correlates the
//! human replies and reactions that come back.

pub mod config;
pub mod init;
pub mod providers;
pub mod relay;
pub mod split;
