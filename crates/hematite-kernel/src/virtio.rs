//! VirtIO block driver (legacy MMIO interface).
//!
//! One queue of `DESC_COUNT` descriptors whose ring memory is a single
//! kernel-pool page. Each request is a three-descriptor chain: header,
//! data buffer, one status byte. The caller publishes the chain on the
//! available ring, kicks the notify register, and spins on the buffer's
//! inflight flag while draining the used ring; a nonzero status byte
//! from the device is fatal. Request headers and status bytes live in a
//! second kernel-pool page so the device can address them.

use crate::memlayout::VIRTIO0;
use crate::pmem::Pool;
use crate::riscv::PGSIZE;
use crate::sync::SpinLock;
use crate::Kernel;
use hematite_fs::{BSIZE, SECTORS_PER_BLOCK};
use hematite_machine::virtio::*;
use std::sync::atomic::{fence, Ordering};

/// Descriptors in the queue; must be a power of two.
pub const DESC_COUNT: usize = 8;

/// Queue layout alignment negotiated with the device.
const RING_ALIGN: u32 = 16;

// Per-descriptor bookkeeping region: a 16-byte request header followed
// by the status byte, one stride per descriptor slot.
const OP_STRIDE: u64 = 32;
const OP_STATUS_OFF: u64 = BLK_REQ_SIZE;

struct VdiskInner {
    /// Ring placement; `layout.base` is the queue page.
    layout: QueueLayout,
    /// Page holding request headers and status bytes.
    ops_pa: u64,
    /// Free descriptor table slots.
    free: [bool; DESC_COUNT],
    /// Shadow of the device's used index.
    used_idx: u16,
    /// Buffer-cache slot served by each in-flight chain head.
    inflight_buf: [Option<usize>; DESC_COUNT],
}

pub struct VirtioDisk {
    inner: SpinLock<VdiskInner>,
}

impl VirtioDisk {
    pub(crate) fn new() -> Self {
        VirtioDisk {
            inner: SpinLock::new("virtio_disk", VdiskInner {
                layout: QueueLayout {
                    base: 0,
                    num: DESC_COUNT as u64,
                    align: RING_ALIGN as u64,
                },
                ops_pa: 0,
                free: [false; DESC_COUNT],
                used_idx: 0,
                inflight_buf: [None; DESC_COUNT],
            }),
        }
    }
}

fn reg_read(kern: &Kernel, off: u64) -> u32 {
    kern.machine.mmio_read_u32(VIRTIO0 + off)
}

fn reg_write(kern: &Kernel, off: u64, val: u32) {
    kern.machine.mmio_write_u32(VIRTIO0 + off, val);
}

impl Kernel {
    /// Probe and initialize the disk: validate identity, negotiate
    /// features, install a one-page queue, and mark all descriptors
    /// free.
    pub(crate) fn virtio_disk_init(&self) {
        let magic = reg_read(self, MMIO_MAGIC_VALUE);
        let version = reg_read(self, MMIO_VERSION);
        let device = reg_read(self, MMIO_DEVICE_ID);
        let vendor = reg_read(self, MMIO_VENDOR_ID);
        if magic != VIRT_MAGIC
            || (version != 1 && version != 2)
            || device != DEVICE_ID_BLOCK
            || vendor != VIRT_VENDOR_QEMU
        {
            panic!(
                "virtio_disk_init: no virtio block device (magic={:#x} version={} device={} vendor={:#x})",
                magic, version, device, vendor
            );
        }

        let mut status = 0u32;
        reg_write(self, MMIO_STATUS, status);
        status |= CONFIG_S_ACKNOWLEDGE;
        reg_write(self, MMIO_STATUS, status);
        status |= CONFIG_S_DRIVER;
        reg_write(self, MMIO_STATUS, status);

        // Decline everything we do not handle.
        let mut features = reg_read(self, MMIO_DEVICE_FEATURES);
        features &= !(1 << BLK_F_RO);
        features &= !(1 << BLK_F_SCSI);
        features &= !(1 << BLK_F_CONFIG_WCE);
        features &= !(1 << BLK_F_MQ);
        features &= !(1 << F_ANY_LAYOUT);
        features &= !(1 << RING_F_EVENT_IDX);
        features &= !(1 << RING_F_INDIRECT_DESC);
        reg_write(self, MMIO_DRIVER_FEATURES, features);

        status |= CONFIG_S_FEATURES_OK;
        reg_write(self, MMIO_STATUS, status);
        status = reg_read(self, MMIO_STATUS);
        assert!(
            status & CONFIG_S_FEATURES_OK != 0,
            "virtio_disk_init: device refused our features"
        );

        reg_write(self, MMIO_QUEUE_SEL, 0);
        assert!(
            reg_read(self, MMIO_QUEUE_READY) == 0,
            "virtio_disk_init: queue already live"
        );
        let max = reg_read(self, MMIO_QUEUE_NUM_MAX);
        assert!(max != 0, "virtio_disk_init: queue 0 missing");
        assert!(
            max >= DESC_COUNT as u32,
            "virtio_disk_init: queue too short"
        );

        let mem = self.mem();
        let queue_pa = self.pmem.alloc(mem, Pool::Kernel);
        mem.fill(queue_pa, PGSIZE as usize, 0);
        let layout = QueueLayout {
            base: queue_pa,
            num: DESC_COUNT as u64,
            align: RING_ALIGN as u64,
        };
        assert!(
            layout.total_size() <= PGSIZE,
            "virtio_disk_init: ring does not fit one page"
        );

        reg_write(self, MMIO_GUEST_PAGE_SIZE, PGSIZE as u32);
        reg_write(self, MMIO_QUEUE_ALIGN, RING_ALIGN);
        reg_write(self, MMIO_QUEUE_NUM, DESC_COUNT as u32);
        reg_write(self, MMIO_QUEUE_PFN, (queue_pa >> 12) as u32);
        reg_write(self, MMIO_QUEUE_READY, 1);

        let ops_pa = self.pmem.alloc(mem, Pool::Kernel);
        mem.fill(ops_pa, PGSIZE as usize, 0);

        {
            let mut d = self.vdisk.inner.lock();
            d.layout = layout;
            d.ops_pa = ops_pa;
            d.free = [true; DESC_COUNT];
            d.used_idx = 0;
        }

        status |= CONFIG_S_DRIVER_OK;
        reg_write(self, MMIO_STATUS, status);
        log::info!("virtio_disk: initialized, queue at {:#x}", queue_pa);
    }

    /// Submit one block read or write and spin until the device
    /// completes it. `buf_idx` names the buffer-cache slot whose
    /// inflight flag the completion clears.
    pub(crate) fn virtio_disk_rw(&self, buf_idx: usize, blockno: u32, data_pa: u64, write: bool) {
        let mem = self.mem();
        let sector = blockno as u64 * SECTORS_PER_BLOCK;
        let mut d = self.vdisk.inner.lock();

        // Wait for three free descriptors, reaping completions while
        // under pressure.
        let chain = loop {
            match alloc_three(&mut d) {
                Some(c) => break c,
                None => self.reap_completions(&mut d),
            }
        };
        let [h, dx, st] = chain;

        let hdr_pa = d.ops_pa + h as u64 * OP_STRIDE;
        let status_pa = hdr_pa + OP_STATUS_OFF;
        let req = VirtioBlkReq {
            typ: if write { BLK_T_OUT } else { BLK_T_IN },
            reserved: 0,
            sector,
        };
        mem.write_bytes(hdr_pa, bytemuck::bytes_of(&req));
        mem.write_u8(status_pa, 0xff);

        write_desc(self, &d, h, VirtqDesc {
            addr: hdr_pa,
            len: BLK_REQ_SIZE as u32,
            flags: VRING_DESC_F_NEXT,
            next: dx as u16,
        });
        write_desc(self, &d, dx, VirtqDesc {
            addr: data_pa,
            len: BSIZE as u32,
            flags: (if write { 0 } else { VRING_DESC_F_WRITE }) | VRING_DESC_F_NEXT,
            next: st as u16,
        });
        write_desc(self, &d, st, VirtqDesc {
            addr: status_pa,
            len: 1,
            flags: VRING_DESC_F_WRITE,
            next: 0,
        });

        self.bcache.set_inflight(buf_idx, true);
        d.inflight_buf[h] = Some(buf_idx);

        // Publish the chain and kick the device.
        let avail_idx = mem.read_u16(d.layout.avail_idx());
        mem.write_u16(
            d.layout.avail_ring(avail_idx as u64 % d.layout.num),
            h as u16,
        );
        fence(Ordering::SeqCst);
        mem.write_u16(d.layout.avail_idx(), avail_idx.wrapping_add(1));
        fence(Ordering::SeqCst);
        reg_write(self, MMIO_QUEUE_NOTIFY, 0);

        while self.bcache.inflight(buf_idx) {
            self.reap_completions(&mut d);
            core::hint::spin_loop();
        }

        d.inflight_buf[h] = None;
        free_chain(self, &mut d, h);
    }

    // Drain the used ring, clearing inflight flags. The device promises
    // a zero status byte; anything else is a firmware bug and fatal.
    fn reap_completions(&self, d: &mut VdiskInner) {
        let mem = self.mem();
        fence(Ordering::SeqCst);
        while d.used_idx != mem.read_u16(d.layout.used_idx()) {
            fence(Ordering::SeqCst);
            let id = mem.read_u32(d.layout.used_ring(d.used_idx as u64 % d.layout.num)) as usize;
            assert!(id < DESC_COUNT, "virtio_disk: bad used-ring id {}", id);
            let status = mem.read_u8(d.ops_pa + id as u64 * OP_STRIDE + OP_STATUS_OFF);
            assert!(status == 0, "virtio_disk: request failed, status {}", status);
            if let Some(buf) = d.inflight_buf[id] {
                self.bcache.set_inflight(buf, false);
            }
            d.used_idx = d.used_idx.wrapping_add(1);
        }
    }

    /// Interrupt path: acknowledge the device and drain completions.
    pub fn virtio_disk_intr(&self) {
        let status = reg_read(self, MMIO_INTERRUPT_STATUS) & 0x3;
        if status != 0 {
            reg_write(self, MMIO_INTERRUPT_ACK, status);
        }
        let mut d = self.vdisk.inner.lock();
        self.reap_completions(&mut d);
    }
}

fn write_desc(kern: &Kernel, d: &VdiskInner, i: usize, desc: VirtqDesc) {
    kern.mem()
        .write_bytes(d.layout.desc(i as u64), bytemuck::bytes_of(&desc));
}

fn alloc_desc(d: &mut VdiskInner) -> Option<usize> {
    for (i, free) in d.free.iter_mut().enumerate() {
        if *free {
            *free = false;
            return Some(i);
        }
    }
    None
}

fn alloc_three(d: &mut VdiskInner) -> Option<[usize; 3]> {
    let mut got = [0usize; 3];
    for i in 0..3 {
        match alloc_desc(d) {
            Some(idx) => got[i] = idx,
            None => {
                for &idx in &got[..i] {
                    free_desc_slot(d, idx);
                }
                return None;
            }
        }
    }
    Some(got)
}

fn free_desc_slot(d: &mut VdiskInner, i: usize) {
    assert!(i < DESC_COUNT, "virtio_disk: descriptor index out of range");
    assert!(!d.free[i], "virtio_disk: double free of descriptor {}", i);
    d.free[i] = true;
}

// Walk NEXT links, clearing and freeing each descriptor of a chain.
fn free_chain(kern: &Kernel, d: &mut VdiskInner, head: usize) {
    let mem = kern.mem();
    let mut i = head;
    loop {
        let mut raw = [0u8; 16];
        mem.read_bytes(d.layout.desc(i as u64), &mut raw);
        let desc: VirtqDesc = bytemuck::pod_read_unaligned(&raw);
        write_desc(kern, d, i, VirtqDesc {
            addr: 0,
            len: 0,
            flags: 0,
            next: 0,
        });
        free_desc_slot(d, i);
        if desc.flags & VRING_DESC_F_NEXT != 0 {
            i = desc.next as usize;
        } else {
            break;
        }
    }
}
