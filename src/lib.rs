//! InboxIQ: email triage for a small repair shop.

pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod store;
pub mod web;
