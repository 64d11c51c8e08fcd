/// Marketplace chat client core
///
/// Realtime chat for the marketplace backend: a STOMP message-bus connection
/// manager, a conversation store that reconciles REST history with realtime
/// events, and an outbound composer with optimistic updates.

pub mod api;
pub mod auth;
pub mod bus;
pub mod client;
pub mod composer;
pub mod config;
pub mod conversation_store;
pub mod error;
pub mod messenger_types;

#[cfg(test)]
pub(crate) mod mocks;

pub use auth::AuthContext;
pub use client::ChatClient;
pub use config::Config;
pub use error::{ChatError, Result};
