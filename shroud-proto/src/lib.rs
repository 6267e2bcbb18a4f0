//! Shared protocol definitions for the Shroud tunnel.
//!
//! Both ends of the tunnel speak the same framed session protocol over a
//! single WebSocket: text control frames (`CONNECT`, `CONNECTED`, `DATA:`,
//! `CLOSE`, `ERROR:`, `PING`, `PONG`) and binary relay frames. This crate
//! holds the frame codec plus the endpoint / fallback-list address types
//! used on both sides.

pub mod addr;
pub mod frame;

pub use addr::{Endpoint, FallbackAddr, ParseAddrError};
pub use frame::{ErrorInfo, Frame, FrameError};
