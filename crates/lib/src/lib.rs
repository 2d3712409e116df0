//! Parley core library: message model, provider adapters, tool registry
//! seam, and the conversation orchestrator shared by the CLI and desktop
//! applications.

pub mod cancel;
pub mod chat;
pub mod conversation;
pub mod events;
pub mod llm;
pub mod message;
pub mod settings;
pub mod tools;
