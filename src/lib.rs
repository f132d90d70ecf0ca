#![doc = include_str!("../docs/overview.md")]
#![allow(missing_docs)] // TODO: enforce once the handler surface settles

pub mod announce;
pub mod brain;
pub mod capability;
pub mod chat;
pub mod config;
pub mod jobs;
pub mod knowledge;
pub mod llm;
pub mod logging;
pub mod server;
pub mod store;
pub mod tracker;
pub mod types;
