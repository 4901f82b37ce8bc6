use std::{
    error::Error,
    fs::{File, OpenOptions},
    io::{self, Read, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
};

use clap::{Parser, Subcommand};

use extent_fs::device::BlockFile;
use extent_fs::fs::{ExtentFileSystem, SectorId, BLOCK_CACHE_SIZE, BLOCK_SIZE};

const BLOCK_NUM: usize = 0x4000;

#[derive(Parser)]
#[command(name = "extent-fs", about = "Extent file system image tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store host files into a fresh image, one extent record per file
    Pack {
        /// Image file (created or truncated)
        #[arg(long, short)]
        image: PathBuf,

        /// Number of sectors in the image
        #[arg(long, default_value_t = BLOCK_NUM)]
        sectors: usize,

        /// Number of block cache slots
        #[arg(long, default_value_t = BLOCK_CACHE_SIZE)]
        cache_slots: usize,

        /// Host files to store
        files: Vec<PathBuf>,
    },
    /// Write the content of the record at a sector to stdout
    Dump {
        /// Image file
        #[arg(long, short)]
        image: PathBuf,

        /// Sector of the extent record
        #[arg(long, short)]
        sector: u32,

        /// Number of block cache slots
        #[arg(long, default_value_t = BLOCK_CACHE_SIZE)]
        cache_slots: usize,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    match Cli::parse().command {
        Command::Pack {
            image,
            sectors,
            cache_slots,
            files,
        } => pack(image, sectors, cache_slots, files),
        Command::Dump {
            image,
            sector,
            cache_slots,
        } => dump(image, SectorId::new(sector), cache_slots),
    }
}

fn pack(
    image: PathBuf,
    sectors: usize,
    cache_slots: usize,
    files: Vec<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    // 创建虚拟块设备, 在创建的时候需要将它的访问权限设置为可读可写
    let block_file = Arc::new(BlockFile(Mutex::new({
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&image)?;
        f.set_len((sectors * BLOCK_SIZE) as u64)?;
        f
    })));

    let efs = ExtentFileSystem::mount(block_file, sectors, cache_slots);
    for path in files {
        // 从 host 文件系统中读取文件
        let mut data = Vec::new();
        File::open(&path)?.read_to_end(&mut data)?;

        let sector = efs.create(0, false)?;
        let inode = efs.open(sector)?;
        let written = inode.write_at(&data, 0)?;
        efs.close(inode)?;
        if written < data.len() {
            eprintln!(
                "{}: image full, stored {} of {} bytes",
                path.display(),
                written,
                data.len()
            );
        }
        println!("{:>6}  {:>10}  {}", sector, written, path.display());
    }
    efs.unmount();
    Ok(())
}

fn dump(image: PathBuf, sector: SectorId, cache_slots: usize) -> Result<(), Box<dyn Error>> {
    let f = OpenOptions::new().read(true).write(true).open(&image)?;
    let sectors = f.metadata()?.len() as usize / BLOCK_SIZE;
    let efs = ExtentFileSystem::mount(Arc::new(BlockFile(Mutex::new(f))), sectors, cache_slots);

    let inode = efs.open(sector)?;
    let mut stdout = io::stdout().lock();
    let mut buffer = [0u8; BLOCK_SIZE];
    let mut offset = 0usize;
    loop {
        let len = inode.read_at(&mut buffer, offset)?;
        if len == 0 {
            break;
        }
        stdout.write_all(&buffer[..len])?;
        offset += len;
    }
    efs.close(inode)?;
    efs.unmount();
    Ok(())
}
