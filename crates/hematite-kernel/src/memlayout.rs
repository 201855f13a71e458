//! Physical and virtual memory layout.
//!
//! Physical map of the board (identity-mapped in the kernel page table):
//!
//! ```text
//! 0x0010_0000  test finisher
//! 0x0200_0000  CLINT
//! 0x0c00_0000  PLIC
//! 0x1000_0000  UART0
//! 0x1000_1000  VIRTIO0 (block)
//! 0x8000_0000  DRAM: kernel image area, then the allocatable region
//! ```
//!
//! Virtual layout near the top of the SV39 space: the trampoline page at
//! the highest address, the trapframe right below it in user space, and
//! in the kernel map one stack per process slot, each with an unmapped
//! guard page beneath it.

use crate::riscv::{PGSIZE, VA_MAX};

pub const UART0: u64 = hematite_machine::UART0_BASE;
pub const UART0_IRQ: u32 = 10;

pub const VIRTIO0: u64 = hematite_machine::VIRTIO0_BASE;
pub const VIRTIO0_IRQ: u32 = 1;

pub const FINISHER: u64 = hematite_machine::FINISHER_BASE;

pub const CLINT_BASE: u64 = 0x0200_0000;
pub const CLINT_SIZE: u64 = 0x10000;

pub const PLIC_BASE: u64 = 0x0c00_0000;
pub const PLIC_SIZE: u64 = 0x40_0000;

pub const KERNEL_BASE: u64 = hematite_machine::DRAM_BASE;
pub const PHYSTOP: u64 = KERNEL_BASE + 128 * 1024 * 1024;

/// End of the kernel image area; frames above this are allocatable.
pub const ALLOC_BEGIN: u64 = KERNEL_BASE + 0x10_0000;

/// Physical page standing in for the trampoline code page (it sits in
/// the kernel image area, like the real trampoline sits in kernel text).
pub const TRAMPOLINE_PA: u64 = KERNEL_BASE;

/// The trampoline page is mapped at the same highest virtual address in
/// every address space.
pub const TRAMPOLINE: u64 = VA_MAX - PGSIZE;

/// Per-process trapframe, just under the trampoline in user space.
pub const TRAPFRAME: u64 = TRAMPOLINE - PGSIZE;

/// Kernel stack of process slot `p`, beneath the trampoline with an
/// unmapped guard page below each stack.
pub const fn kstack(p: usize) -> u64 {
    TRAMPOLINE - ((p as u64) + 1) * 2 * PGSIZE
}
