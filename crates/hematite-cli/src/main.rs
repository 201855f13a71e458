use anyhow::Result;
use clap::{Parser, Subcommand};
use hematite_kernel::file::OpenFlags;
use hematite_kernel::{Kernel, UserEnv};
use hematite_machine::{Machine, MachineConfig, DEFAULT_DISK_BYTES};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot the kernel and run the demo init program
    Demo {
        /// Disk image to attach; a blank in-memory disk if omitted
        #[arg(long)]
        disk: Option<PathBuf>,

        /// Guest memory in MiB
        #[arg(long, default_value_t = 128)]
        memory: usize,

        /// Write the disk image back after the run
        #[arg(long)]
        save: bool,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Demo { disk, memory, save } => {
            let image = match &disk {
                Some(path) => std::fs::read(path)?,
                None => vec![0; DEFAULT_DISK_BYTES],
            };
            println!("booting hematite ({} MiB ram)...", memory);

            let machine = Machine::new(MachineConfig {
                dram_bytes: memory * 1024 * 1024,
                disk: image,
            })?;
            let kernel = Kernel::new(machine.clone());
            let result = kernel.boot(Box::new(demo_main)).wait();

            print!("{}", result.console);
            println!("== machine halted, exit code {} ==", result.code);

            if save {
                if let Some(path) = &disk {
                    std::fs::write(path, machine.disk_snapshot())?;
                    println!("disk written back to {}", path.display());
                }
            }
        }
    }
    Ok(())
}

// A small tour of the kernel: console, heap, filesystem, fork/wait.
fn demo_main(env: &mut UserEnv) -> i32 {
    env.print("hello from init\n");

    let heap = env.brk(0);
    env.brk(heap as u64 + 4096);
    env.poke(heap as u64, 0x42);
    env.print("heap grown by one page\n");

    let fd = env.open("/hello", OpenFlags::CREATE | OpenFlags::RDWR);
    if fd < 0 {
        env.print("open failed\n");
        return 1;
    }
    env.write(fd, b"written through the log\n");
    env.close(fd);

    let fd = env.open("/hello", OpenFlags::empty());
    let mut buf = [0u8; 64];
    let n = env.read(fd, &mut buf);
    env.close(fd);
    if n > 0 {
        env.print(core::str::from_utf8(&buf[..n as usize]).unwrap_or("<binary>"));
    }

    let pid = env.fork(|env| {
        env.print("child: hello\n");
        7
    });
    let (got, status) = env.wait();
    if got == pid && status == 7 {
        env.print("parent: child reaped\n");
    }

    env.print("demo done\n");
    0
}
