//! pacbridge - PAC-driven proxy resolution and a local SOCKS5 gateway that
//! bridges client connections through an upstream HTTP CONNECT, SOCKS4, or
//! SOCKS5 proxy.

pub mod address;
pub mod async_stream;
pub mod bridge;
pub mod config;
pub mod error;
pub mod gateway;
pub mod line_reader;
pub mod pac;
pub mod upstream;
pub mod util;
