//! Test finisher, as on the QEMU virt board: a single register whose
//! write ends the machine. The bus notices the request and powers off.

use super::Device;
use crate::memory::PhysMemory;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

pub const FINISHER_PASS: u32 = 0x5555;

pub struct Finisher {
    requested: AtomicBool,
    code: AtomicU32,
}

impl Finisher {
    pub fn new() -> Self {
        Finisher {
            requested: AtomicBool::new(false),
            code: AtomicU32::new(0),
        }
    }

    pub fn requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn code(&self) -> u32 {
        self.code.load(Ordering::SeqCst)
    }
}

impl Default for Finisher {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for Finisher {
    fn name(&self) -> &str {
        "test-finisher"
    }

    fn read(&self, _offset: u64, _dram: &PhysMemory) -> u32 {
        0
    }

    fn write(&self, offset: u64, val: u32, _dram: &PhysMemory) {
        if offset == 0 {
            self.code.store(val >> 16, Ordering::SeqCst);
            self.requested.store(true, Ordering::SeqCst);
        }
    }
}
