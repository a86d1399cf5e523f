//! ladmin library crate.
//!
//! This library provides the pieces behind the `ladmin` console and the
//! `ladmind` reference daemon, including:
//! - The admin directory request protocol (client and daemon side)
//! - Telnet option negotiation and stream filtering
//! - Process launching with a start watchdog
//! - The interactive proxy loop and local terminal handling

pub mod admind;
pub mod config;
pub mod console;
pub mod launcher;
pub mod logging;
pub mod shutdown;
pub mod telnet;
pub mod terminal;
