//! Pare: mailbox sync and email classification engine.

pub mod classify;
pub mod config;
pub mod error;
pub mod llm;
pub mod mail;
pub mod pipeline;
pub mod store;
pub mod worker;
