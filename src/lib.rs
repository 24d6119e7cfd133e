#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

pub mod catalog;
pub mod client;
pub mod cluster;
pub mod dispatch;
pub mod encoding;
pub mod error;
pub mod message;
pub mod plugin;
pub mod server;

pub use client::Client;
pub use server::{Engine, Server};
