//! Mail knowledge: email intake, knowledge extraction and audit.

pub mod api;
pub mod config;
pub mod error;
pub mod llm;
pub mod mail;
pub mod pipeline;
pub mod store;
