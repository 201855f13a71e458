//! VirtIO block device model (legacy MMIO interface).
//!
//! Backs a 512-byte-sector disk with an in-memory image. On a queue
//! notify it consumes available-ring entries, walks each three-descriptor
//! chain (request header, data buffer, status byte), moves the data
//! between guest DRAM and the disk, and publishes completions on the used
//! ring.
//!
//! For crash testing the device accepts a persisted-write budget: write
//! requests past the budget still complete successfully from the driver's
//! point of view but are not persisted, modeling fail-stop loss of
//! anything the device had not yet committed.

use super::Device;
use crate::memory::PhysMemory;
use crate::virtio::*;
use std::sync::atomic::{fence, Ordering};
use std::sync::Mutex;

struct Regs {
    status: u32,
    driver_features: u32,
    guest_page_size: u32,
    queue_sel: u32,
    queue_num: u32,
    queue_align: u32,
    queue_pfn: u32,
    queue_ready: u32,
    intr_status: u32,
    /// Next available-ring slot the device will look at.
    last_avail: u16,
    /// Device-side used index, mirrored into the ring after each completion.
    used_idx: u16,
}

struct Disk {
    data: Vec<u8>,
    /// Write requests persisted so far.
    writes: u64,
    /// Writes beyond this budget are acknowledged but dropped.
    write_limit: Option<u64>,
}

pub struct VirtioBlk {
    regs: Mutex<Regs>,
    disk: Mutex<Disk>,
}

impl VirtioBlk {
    pub fn new(image: Vec<u8>) -> Self {
        assert!(
            image.len() % SECTOR_SIZE == 0,
            "disk image must be whole sectors"
        );
        VirtioBlk {
            regs: Mutex::new(Regs {
                status: 0,
                driver_features: 0,
                guest_page_size: 4096,
                queue_sel: 0,
                queue_num: 0,
                queue_align: 4096,
                queue_pfn: 0,
                queue_ready: 0,
                intr_status: 0,
                last_avail: 0,
                used_idx: 0,
            }),
            disk: Mutex::new(Disk {
                data: image,
                writes: 0,
                write_limit: None,
            }),
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.disk.lock().unwrap().data.clone()
    }

    pub fn writes_persisted(&self) -> u64 {
        self.disk.lock().unwrap().writes
    }

    /// Persist at most `limit` further write requests; the rest are lost.
    pub fn set_write_limit(&self, limit: u64) {
        let mut disk = self.disk.lock().unwrap();
        let done = disk.writes;
        disk.write_limit = Some(done + limit);
    }

    pub fn clear_write_limit(&self) {
        self.disk.lock().unwrap().write_limit = None;
    }

    fn process_queue(&self, regs: &mut Regs, dram: &PhysMemory) {
        if regs.queue_pfn == 0 || regs.queue_num == 0 {
            return;
        }
        let layout = QueueLayout {
            base: regs.queue_pfn as u64 * regs.guest_page_size as u64,
            num: regs.queue_num as u64,
            align: regs.queue_align.max(4) as u64,
        };

        loop {
            fence(Ordering::SeqCst);
            let avail_idx = dram.read_u16(layout.avail_idx());
            if regs.last_avail == avail_idx {
                break;
            }
            let slot = regs.last_avail as u64 % layout.num;
            let head = dram.read_u16(layout.avail_ring(slot));
            let written = self.run_chain(dram, &layout, head as u64);

            let used = layout.used_ring(regs.used_idx as u64 % layout.num);
            dram.write_u32(used, head as u32);
            dram.write_u32(used + 4, written);
            fence(Ordering::SeqCst);
            regs.used_idx = regs.used_idx.wrapping_add(1);
            dram.write_u16(layout.used_idx(), regs.used_idx);
            regs.intr_status |= 1;
            regs.last_avail = regs.last_avail.wrapping_add(1);
        }
    }

    fn read_desc(&self, dram: &PhysMemory, layout: &QueueLayout, i: u64) -> VirtqDesc {
        assert!(i < layout.num, "virtio-blk: descriptor index out of range");
        let mut raw = [0u8; 16];
        dram.read_bytes(layout.desc(i), &mut raw);
        bytemuck::pod_read_unaligned(&raw)
    }

    /// Execute one request chain, returning the used-ring length field.
    fn run_chain(&self, dram: &PhysMemory, layout: &QueueLayout, head: u64) -> u32 {
        let d0 = self.read_desc(dram, layout, head);
        assert!(
            d0.flags & VRING_DESC_F_NEXT != 0,
            "virtio-blk: lone header descriptor"
        );
        let d1 = self.read_desc(dram, layout, d0.next as u64);
        assert!(
            d1.flags & VRING_DESC_F_NEXT != 0,
            "virtio-blk: chain missing status descriptor"
        );
        let d2 = self.read_desc(dram, layout, d1.next as u64);
        assert!(
            d2.flags & VRING_DESC_F_WRITE != 0 && d2.len == 1,
            "virtio-blk: malformed status descriptor"
        );

        let mut raw = [0u8; 16];
        dram.read_bytes(d0.addr, &mut raw);
        let req: VirtioBlkReq = bytemuck::pod_read_unaligned(&raw);
        let offset = req.sector as usize * SECTOR_SIZE;
        let len = d1.len as usize;

        let mut disk = self.disk.lock().unwrap();
        assert!(
            offset + len <= disk.data.len(),
            "virtio-blk: request beyond end of disk (sector {})",
            req.sector
        );

        let written = match req.typ {
            BLK_T_IN => {
                assert!(
                    d1.flags & VRING_DESC_F_WRITE != 0,
                    "virtio-blk: read into device-readable buffer"
                );
                let mut buf = vec![0u8; len];
                buf.copy_from_slice(&disk.data[offset..offset + len]);
                dram.write_bytes(d1.addr, &buf);
                d1.len + 1
            }
            BLK_T_OUT => {
                let persist = match disk.write_limit {
                    Some(limit) => disk.writes < limit,
                    None => true,
                };
                if persist {
                    let mut buf = vec![0u8; len];
                    dram.read_bytes(d1.addr, &mut buf);
                    disk.data[offset..offset + len].copy_from_slice(&buf);
                }
                disk.writes += 1;
                1
            }
            other => panic!("virtio-blk: unknown request type {}", other),
        };

        // The device promises zero on success.
        dram.write_u8(d2.addr, 0);
        written
    }
}

impl Device for VirtioBlk {
    fn name(&self) -> &str {
        "virtio-blk"
    }

    fn read(&self, offset: u64, _dram: &PhysMemory) -> u32 {
        let regs = self.regs.lock().unwrap();
        match offset {
            MMIO_MAGIC_VALUE => VIRT_MAGIC,
            MMIO_VERSION => VIRT_VERSION,
            MMIO_DEVICE_ID => DEVICE_ID_BLOCK,
            MMIO_VENDOR_ID => VIRT_VENDOR_QEMU,
            // No features the driver would have to decline are offered.
            MMIO_DEVICE_FEATURES => 0,
            MMIO_QUEUE_NUM_MAX => 32,
            MMIO_QUEUE_PFN => regs.queue_pfn,
            MMIO_QUEUE_READY => regs.queue_ready,
            MMIO_INTERRUPT_STATUS => regs.intr_status,
            MMIO_STATUS => regs.status,
            _ => {
                log::warn!("virtio-blk: read of unknown register {:#x}", offset);
                0
            }
        }
    }

    fn write(&self, offset: u64, val: u32, dram: &PhysMemory) {
        let mut regs = self.regs.lock().unwrap();
        match offset {
            MMIO_DRIVER_FEATURES => regs.driver_features = val,
            MMIO_GUEST_PAGE_SIZE => regs.guest_page_size = val,
            MMIO_QUEUE_SEL => regs.queue_sel = val,
            MMIO_QUEUE_NUM => regs.queue_num = val,
            MMIO_QUEUE_ALIGN => regs.queue_align = val,
            MMIO_QUEUE_PFN => regs.queue_pfn = val,
            MMIO_QUEUE_READY => regs.queue_ready = val,
            MMIO_QUEUE_NOTIFY => self.process_queue(&mut regs, dram),
            MMIO_INTERRUPT_ACK => regs.intr_status &= !val,
            MMIO_STATUS => regs.status = val,
            _ => log::warn!(
                "virtio-blk: write of unknown register {:#x} = {:#x}",
                offset,
                val
            ),
        }
    }
}
