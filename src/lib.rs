#![allow(dead_code)]
// Library entrypoint for integration tests and internal reuse.
pub mod agent;
pub mod api;
pub mod config;
pub mod image_api;
pub mod llm;
pub mod mailbox;
pub mod object_store;
pub mod rate_limit;
pub mod schemas;
pub mod shutdown;
pub mod state;
pub mod storage;
pub mod tools;
