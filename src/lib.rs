//! # ch32v003-rsp
//!
//! A byte-driven GDB Remote Serial Protocol endpoint for a CH32V003 debug
//! probe. [`RspServer`] owns the wire framing, command dispatch, and flash
//! write-coalescing; it is wholly synchronous and `no_std`-shaped (no heap
//! allocation, fixed-size buffers), leaving the actual transport — USB,
//! UART, whatever carries bytes to and from `gdb`'s `target remote` — to
//! the caller.
//!
//! Reaching the target silicon itself is delegated through the
//! [`TargetAdapter`] trait, so this crate never speaks to hardware
//! directly; a caller provides an adapter that knows how to read and write
//! registers and flash on a halted RISC-V debug module.
//!
//! ## Example
//! ```
//! use ch32v003_rsp::{RspServer, TargetAdapter};
//!
//! struct DemoTarget {
//!     gpr: [u32; 16],
//!     dpc: u32,
//! }
//!
//! impl TargetAdapter for DemoTarget {
//!     fn get_gpr(&mut self, index: u8) -> u32 {
//!         self.gpr[index as usize]
//!     }
//!     fn set_gpr(&mut self, index: u8, value: u32) {
//!         self.gpr[index as usize] = value;
//!     }
//!     fn get_csr(&mut self, _id: u16) -> u32 {
//!         self.dpc
//!     }
//!     fn set_csr(&mut self, _id: u16, value: u32) {
//!         self.dpc = value;
//!     }
//!     fn get_mem(&mut self, _addr: u32) -> u32 {
//!         0
//!     }
//!     fn set_mem(&mut self, _addr: u32, _value: u32) {}
//!     fn get_block(&mut self, _addr: u32, out: &mut [u32]) {
//!         out.fill(0);
//!     }
//!     fn wipe_chip(&mut self) {}
//!     fn wipe_sector(&mut self, _addr: u32) {}
//!     fn wipe_page(&mut self, _addr: u32) {}
//!     fn write_flash(&mut self, _page_base: u32, _data: &[u32; 16]) {}
//! }
//!
//! let mut target = DemoTarget { gpr: [0; 16], dpc: 0 };
//! let mut server = RspServer::new(&mut target);
//!
//! // Feed "$?#3f" in and collect the reply byte-by-byte.
//! let mut reply = Vec::new();
//! for &b in b"$?#3f" {
//!     let (out, valid) = server.tick(b, true);
//!     if valid {
//!         reply.push(out);
//!     }
//! }
//! loop {
//!     let (out, valid) = server.tick(0, false);
//!     if !valid {
//!         break;
//!     }
//!     reply.push(out);
//! }
//! assert_eq!(reply, b"+$T02#b6");
//! ```

/// Largest packet body this endpoint will hold, in either direction.
/// Matches the `PacketSize=32768` advertised in the `qSupported` reply,
/// so a `vFlashWrite` spanning the full negotiated packet always fits.
pub const PACKET_SIZE: usize = 32768;

pub mod flash_cache;
pub mod recv_buffer;
pub mod send_buffer;
pub mod server;
pub mod target;

pub use flash_cache::FlashError;
pub use server::RspServer;
pub use target::{TargetAdapter, CSR_DPC, MEMORY_MAP_XML};
