//! Format a disk image with an empty Hematite filesystem: superblock,
//! zeroed log, inode table with the root directory, and the free
//! bitmap. The layout matches what the kernel's own formatter writes,
//! so either path produces a mountable image.

use anyhow::{bail, Result};
use clap::Parser;
use hematite_fs::{
    Dinode, Dirent, Superblock, BPB, BSIZE, DIRSIZ, FSSIZE, IPB, ROOTINO, T_DIR,
};
use std::path::PathBuf;
use zerocopy::{AsBytes, FromZeroes};

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Path of the disk image to write
    #[arg(short, long)]
    disk: PathBuf,

    /// Image size in blocks
    #[arg(short, long, default_value_t = FSSIZE)]
    size: u32,
}

fn put(image: &mut [u8], block: u32, offset: usize, bytes: &[u8]) {
    let base = block as usize * BSIZE + offset;
    image[base..base + bytes.len()].copy_from_slice(bytes);
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.size < 150 {
        bail!("image of {} blocks leaves no room for data", cli.size);
    }
    if cli.size > BPB {
        bail!("one bitmap block covers at most {} blocks", BPB);
    }
    let sb = Superblock::fresh(cli.size);

    let mut image = vec![0u8; cli.size as usize * BSIZE];

    // Block 1: superblock. The log region stays zeroed (empty header).
    put(&mut image, 1, 0, sb.as_bytes());

    // Root directory: one data block with "." and "..".
    let root_data = sb.bmapstart + 1;
    let dot = Dirent::new(ROOTINO as u16, ".");
    let dotdot = Dirent::new(ROOTINO as u16, "..");
    put(&mut image, root_data, 0, dot.as_bytes());
    put(
        &mut image,
        root_data,
        core::mem::size_of::<Dirent>(),
        dotdot.as_bytes(),
    );

    let mut root = Dinode::new_zeroed();
    root.typ = T_DIR;
    root.nlink = 2;
    root.size = (2 * core::mem::size_of::<Dirent>()) as u32;
    root.addrs[0] = root_data;
    put(
        &mut image,
        sb.iblock(ROOTINO),
        (ROOTINO % IPB) as usize * core::mem::size_of::<Dinode>(),
        root.as_bytes(),
    );

    // Bitmap: metadata blocks plus the root directory's data block.
    let mut bits = vec![0u8; BSIZE];
    for b in 0..=root_data {
        bits[(b / 8) as usize] |= 1 << (b % 8);
    }
    put(&mut image, sb.bmapstart, 0, &bits);

    std::fs::write(&cli.disk, &image)?;
    println!(
        "{}: {} blocks, log {}, inodes {} (name limit {}), data from block {}",
        cli.disk.display(),
        sb.size,
        sb.nlog,
        sb.ninodes,
        DIRSIZ,
        root_data
    );
    Ok(())
}
