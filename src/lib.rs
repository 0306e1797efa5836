//! Devrunner - a development runner for a bundled backend and frontend
//!
//! This library wires an external module bundler into a development loop that:
//! - Rebuilds the backend bundle on source change and restarts it as a child process
//! - Rebuilds the frontend bundle and serves its assets with live reload
//! - Proxies every other request from the frontend port to the backend port

pub mod backend;
pub mod compiler;
pub mod config;
pub mod devserver;
pub mod error;
pub mod proxy;
pub mod supervisor;
