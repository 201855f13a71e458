//! The Hematite machine: a QEMU-virt-shaped board model the kernel runs
//! against. Guest DRAM at `0x8000_0000`, a UART, a VirtIO-MMIO block
//! device, and a test finisher for power-off. Harts are host threads; the
//! context-switch primitive lives in [`hart`].
//!
//! The machine executes no instructions. Kernel code runs natively and
//! touches the board exclusively through physical addresses, so page
//! tables, rings and disk blocks are all real bytes in guest memory.

pub mod devices;
pub mod error;
pub mod hart;
pub mod memory;
pub mod virtio;

use devices::power::Finisher;
use devices::uart::Uart;
use devices::virtio_blk::VirtioBlk;
use devices::Device;
use error::MachineError;
use hart::{Context, HaltHub};
use memory::PhysMemory;
use std::sync::Arc;

pub const DRAM_BASE: u64 = 0x8000_0000;
pub const DEFAULT_DRAM_BYTES: usize = 128 * 1024 * 1024;
pub const DEFAULT_DISK_BYTES: usize = 8 * 1024 * 1024;

pub const UART0_BASE: u64 = 0x1000_0000;
pub const VIRTIO0_BASE: u64 = 0x1000_1000;
pub const FINISHER_BASE: u64 = 0x0010_0000;
const DEVICE_SPAN: u64 = 0x1000;

pub struct MachineConfig {
    pub dram_bytes: usize,
    /// Raw disk image; zeroed images are formatted by the kernel on boot.
    pub disk: Vec<u8>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            dram_bytes: DEFAULT_DRAM_BYTES,
            disk: vec![0; DEFAULT_DISK_BYTES],
        }
    }
}

pub struct Machine {
    dram: PhysMemory,
    uart: Uart,
    vblk: VirtioBlk,
    finisher: Finisher,
    hub: Arc<HaltHub>,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Result<Arc<Machine>, MachineError> {
        if config.dram_bytes == 0 || config.dram_bytes % 4096 != 0 {
            return Err(MachineError::BadDramSize(config.dram_bytes));
        }
        if config.disk.is_empty() || config.disk.len() % 512 != 0 {
            return Err(MachineError::BadDiskSize(config.disk.len()));
        }
        log::debug!(
            "machine: dram {} MiB, disk {} KiB",
            config.dram_bytes / (1024 * 1024),
            config.disk.len() / 1024
        );
        Ok(Arc::new(Machine {
            dram: PhysMemory::new(DRAM_BASE, config.dram_bytes),
            uart: Uart::new(),
            vblk: VirtioBlk::new(config.disk),
            finisher: Finisher::new(),
            hub: HaltHub::new(),
        }))
    }

    /// Guest DRAM. Most kernel memory traffic goes straight here.
    pub fn mem(&self) -> &PhysMemory {
        &self.dram
    }

    fn device_at(&self, pa: u64) -> Option<(&dyn Device, u64)> {
        for (base, dev) in [
            (UART0_BASE, &self.uart as &dyn Device),
            (VIRTIO0_BASE, &self.vblk as &dyn Device),
            (FINISHER_BASE, &self.finisher as &dyn Device),
        ] {
            if pa >= base && pa < base + DEVICE_SPAN {
                return Some((dev, pa - base));
            }
        }
        None
    }

    /// 32-bit load on the system bus: DRAM or a device register.
    pub fn mmio_read_u32(&self, pa: u64) -> u32 {
        if self.dram.contains(pa) {
            return self.dram.read_u32(pa);
        }
        match self.device_at(pa) {
            Some((dev, off)) => dev.read(off, &self.dram),
            None => panic!("bus: load from unmapped address {:#x}", pa),
        }
    }

    /// 32-bit store on the system bus.
    pub fn mmio_write_u32(&self, pa: u64, val: u32) {
        if self.dram.contains(pa) {
            self.dram.write_u32(pa, val);
            return;
        }
        match self.device_at(pa) {
            Some((dev, off)) => dev.write(off, val, &self.dram),
            None => panic!("bus: store to unmapped address {:#x}", pa),
        }
        if self.finisher.requested() {
            self.power_off();
        }
    }

    /// Byte-wide store, for byte-granular device registers (the UART).
    pub fn mmio_write_u8(&self, pa: u64, val: u8) {
        self.mmio_write_u32(pa, val as u32);
    }

    pub fn mmio_read_u8(&self, pa: u64) -> u8 {
        self.mmio_read_u32(pa) as u8
    }

    /// Console output captured by the UART so far.
    pub fn console(&self) -> String {
        self.uart.output()
    }

    pub fn power_off(&self) {
        if !self.hub.is_halted() {
            log::debug!("machine: power off");
        }
        self.hub.halt();
    }

    pub fn halted(&self) -> bool {
        self.hub.is_halted()
    }

    /// Exit code stored by the test finisher, if any.
    pub fn finisher_code(&self) -> u32 {
        self.finisher.code()
    }

    /// Did power-off come from the finisher (an orderly shutdown), as
    /// opposed to a panic-driven halt?
    pub fn finisher_requested(&self) -> bool {
        self.finisher.requested()
    }

    /// Create a suspendable kernel execution. With an entry closure the
    /// context starts a fresh task on first switch-in; without one it
    /// belongs to the calling thread, which will park in it.
    pub fn new_context(&self, entry: Option<Box<dyn FnOnce() + Send>>) -> Context {
        Context::new(self.hub.clone(), entry)
    }

    // Disk plumbing for tests and tools.

    pub fn disk_snapshot(&self) -> Vec<u8> {
        self.vblk.snapshot()
    }

    pub fn disk_writes_persisted(&self) -> u64 {
        self.vblk.writes_persisted()
    }

    pub fn disk_set_write_limit(&self, limit: u64) {
        self.vblk.set_write_limit(limit)
    }

    pub fn disk_clear_write_limit(&self) {
        self.vblk.clear_write_limit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uart_console_capture() {
        let m = Machine::new(MachineConfig {
            dram_bytes: 0x10000,
            disk: vec![0; 512],
        })
        .unwrap();
        for b in b"hi" {
            m.mmio_write_u8(UART0_BASE, *b);
        }
        assert_eq!(m.console(), "hi");
    }

    #[test]
    fn finisher_powers_off() {
        let m = Machine::new(MachineConfig {
            dram_bytes: 0x10000,
            disk: vec![0; 512],
        })
        .unwrap();
        assert!(!m.halted());
        m.mmio_write_u32(FINISHER_BASE, devices::power::FINISHER_PASS);
        assert!(m.halted());
    }

    #[test]
    fn virtio_probe_registers() {
        let m = Machine::new(MachineConfig {
            dram_bytes: 0x10000,
            disk: vec![0; 4096],
        })
        .unwrap();
        assert_eq!(
            m.mmio_read_u32(VIRTIO0_BASE + virtio::MMIO_MAGIC_VALUE),
            virtio::VIRT_MAGIC
        );
        assert_eq!(
            m.mmio_read_u32(VIRTIO0_BASE + virtio::MMIO_DEVICE_ID),
            virtio::DEVICE_ID_BLOCK
        );
    }
}
