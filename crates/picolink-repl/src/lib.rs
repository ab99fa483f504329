//! # picolink – MicroPython raw REPL driver
//!
//! Drives a MicroPython board's interactive interpreter over a serial byte
//! stream to manage its on-board filesystem:
//!
//! - **Transport** – abstracted duplex byte channel with exclusive reader /
//!   writer leases, a `serialport` back-end and an in-memory simulation
//! - **Stream Synchronizer** – turns arbitrarily chunked output into marker
//!   matches, captured lines and raw byte captures
//! - **Mode Controller** – interrupt / raw / soft-reset / normal transitions
//! - **Command Executor** – block-wise script submission in raw mode
//! - **File Transfer** – length-prefixed, `0xFF`-padded upload frames and
//!   terminator-delimited downloads
//! - **Filesystem Walker** – listing script plus tree parser
//! - **Session** – single-flight guarded high-level operations

pub mod repl;
