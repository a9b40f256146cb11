#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

pub mod client;
pub mod encoding;
pub mod error;
pub mod mvcc;
pub mod raft;
pub mod region;
pub mod server;
pub mod service;
pub mod storage;
pub mod store;

pub use client::Client;
pub use server::Server;
