#![deny(clippy::expect_used, clippy::unwrap_used)]

//! The root of the multiplexed single-connection client library.
//! 单连接多路复用客户端库的根。

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod transport;

mod pipeline;
