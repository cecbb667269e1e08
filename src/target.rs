//! The capability the core borrows to reach the actual silicon: register,
//! memory, and flash operations on a halted RISC-V debug-module target.
//! Everything below this trait — the single-wire transport, the debug
//! module abstraction, the flash device driver — lives outside this crate.

/// Debug Program Counter CSR — the resume PC while the target is halted.
pub const CSR_DPC: u16 = 0x7B1;

/// Total flash size of a CH32V003-class target.
pub const FLASH_SIZE: u32 = 0x4000;

/// Total RAM size of a CH32V003-class target.
pub const RAM_SIZE: u32 = 0x800;

/// Flash programming unit.
pub const PAGE_SIZE: u32 = 64;

/// Flash erase unit above a page.
pub const SECTOR_SIZE: u32 = 1024;

/// Number of general-purpose integer registers in the target's E-class
/// RISC-V profile.
pub const GPR_COUNT: u8 = 16;

/// Register, memory, and flash primitives the RSP core drives. All
/// operations are blocking and synchronous; none of them are invoked
/// concurrently with each other since the core itself is single-threaded.
pub trait TargetAdapter {
    fn get_gpr(&mut self, index: u8) -> u32;
    fn set_gpr(&mut self, index: u8, value: u32);

    /// Read a control/status register. At minimum [`CSR_DPC`] must be
    /// supported.
    fn get_csr(&mut self, id: u16) -> u32;

    /// Write a control/status register. At minimum [`CSR_DPC`] must be
    /// supported, so that `G`'s trailing PC field takes effect.
    fn set_csr(&mut self, id: u16, value: u32);

    fn get_mem(&mut self, addr: u32) -> u32;
    fn set_mem(&mut self, addr: u32, value: u32);

    /// Read `out.len()` consecutive words starting at `addr`.
    fn get_block(&mut self, addr: u32, out: &mut [u32]);

    fn wipe_chip(&mut self);
    fn wipe_sector(&mut self, addr: u32);
    fn wipe_page(&mut self, addr: u32);

    /// Program one 64-byte (16-word) flash page. `page_base` is always a
    /// multiple of [`PAGE_SIZE`].
    fn write_flash(&mut self, page_base: u32, data: &[u32; 16]);
}

/// Body of the `qXfer:memory-map:read` reply, describing the CH32V003's
/// flash and RAM regions to the debugger.
pub const MEMORY_MAP_XML: &str = concat!(
    "<?xml version=\"1.0\"?>\n",
    "<!DOCTYPE memory-map PUBLIC \"+//IDN gnu.org//DTD GDB Memory Map V1.0//EN\" ",
    "\"http://sourceware.org/gdb/gdb-memory-map.dtd\">\n",
    "<memory-map>\n",
    "  <memory type=\"flash\" start=\"0x00000000\" length=\"0x4000\">\n",
    "    <property name=\"blocksize\">64</property>\n",
    "  </memory>\n",
    "  <memory type=\"ram\" start=\"0x20000000\" length=\"0x800\"/>\n",
    "</memory-map>\n",
);
