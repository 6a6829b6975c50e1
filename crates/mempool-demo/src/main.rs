use std::{path::PathBuf, process, ptr::NonNull, slice};

use argh::FromArgs;
use mempool::{ArenaConfig, FreeListPool, IndexedPool, PoolAllocator, SharedArena};
use snafu::{OptionExt as _, ResultExt as _};
use snafu_utils::{GenericError, Report};

mod logger;

/// Exercise the memory pools and the shared arena.
///
/// Set MEMPOOL_LOG to `trace`, `debug`, `info`, `warn`, `error` or `off` to
/// choose how much the allocators log.
#[derive(Debug, FromArgs)]
struct Args {
    #[argh(subcommand)]
    command: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Indexed(IndexedArgs),
    FreeList(FreeListArgs),
    Shared(SharedArgs),
}

/// Allocate and release blocks of a pool that validates every release.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "indexed")]
struct IndexedArgs {
    /// number of blocks in the pool
    #[argh(option, default = "256")]
    blocks: usize,
    /// size of each block in bytes
    #[argh(option, default = "256")]
    block_size: usize,
}

/// Allocate and release blocks of an intrusive free-list pool, then share it
/// with a typed allocator handle.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "free-list")]
struct FreeListArgs {
    /// number of blocks in the pool
    #[argh(option, default = "256")]
    blocks: usize,
    /// size of each block in bytes
    #[argh(option, default = "256")]
    block_size: usize,
}

/// Create or join a shared arena and allocate from it.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "shared")]
struct SharedArgs {
    /// existing file from which the segment key is derived
    #[argh(positional)]
    key_path: PathBuf,
    /// semaphore name, `/` followed by a name without `/`
    #[argh(option, default = "String::from(\"/mempool-demo\")")]
    semaphore: String,
    /// bytes available to blocks, headers included
    #[argh(option, default = "2048")]
    size: usize,
    /// size of the first allocation in bytes
    #[argh(option, default = "256")]
    block_size: usize,
    /// print every block of the arena before exiting
    #[argh(switch)]
    dump: bool,
}

const FIRST_MESSAGE: &str = "This is my first block of memory!";
const SHARED_MESSAGE: &str = "This memory will be shared!";
const ARRAY: [i32; 4] = [80, 61, 78, 80];

fn main() {
    let args: Args = argh::from_env();

    if let Err(err) = logger::init() {
        eprintln!("failed to install logger: {err}");
    }

    if let Err(err) = run(&args) {
        let report = Report::new(err);
        eprintln!("{report}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), GenericError> {
    match &args.command {
        Command::Indexed(args) => run_indexed(args),
        Command::FreeList(args) => run_free_list(args),
        Command::Shared(args) => run_shared(args),
    }
}

fn run_indexed(args: &IndexedArgs) -> Result<(), GenericError> {
    let mut pool = IndexedPool::new(args.blocks, args.block_size)
        .whatever_context("failed to create indexed pool")?;

    println!("Allocating a block of memory.");
    let block = pool.allocate().whatever_context("failed to allocate a block")?;
    println!("{}", unsafe { store_text(block, pool.block_size(), FIRST_MESSAGE) });

    for _ in 0..5 {
        pool.allocate()
            .whatever_context("failed to allocate a new block")?;
        println!("Allocating a new block of memory.");
    }

    println!("Freeing the first block.");
    pool.deallocate(block.as_ptr())
        .whatever_context("failed to free the first block")?;
    println!("{} of {} blocks in use.", pool.in_use(), pool.capacity());
    Ok(())
}

fn run_free_list(args: &FreeListArgs) -> Result<(), GenericError> {
    let mut pool = FreeListPool::new(args.blocks, args.block_size)
        .whatever_context("failed to create free-list pool")?;

    println!("Allocating a block of memory.");
    let block = pool.allocate().whatever_context("failed to allocate a block")?;
    println!("{}", unsafe { store_text(block, pool.block_size(), FIRST_MESSAGE) });

    println!("Freeing the block.");
    unsafe { pool.deallocate(block.as_ptr()) }.whatever_context("failed to free the block")?;

    let ints = PoolAllocator::<i32>::new(pool);
    println!(
        "Allocating an array of {} ints through a typed handle.",
        ARRAY.len()
    );
    let array = ints
        .allocate(ARRAY.len())
        .whatever_context("failed to allocate an array")?;
    unsafe { print_array(array) };
    unsafe { ints.deallocate(array, ARRAY.len()) };
    println!("{} blocks available.", ints.available());
    Ok(())
}

fn run_shared(args: &SharedArgs) -> Result<(), GenericError> {
    let config = ArenaConfig::new(&args.key_path, &args.semaphore, args.size)
        .whatever_context("invalid arena configuration")?;
    let arena = SharedArena::open(&config).whatever_context("failed to open shared arena")?;
    let size = arena.size().whatever_context("failed to read arena size")?;
    println!(
        "{} a shared arena of {size} bytes.",
        if arena.is_creator() { "Created" } else { "Joined" }
    );

    println!("Allocating a {}B block of memory.", args.block_size);
    let block = arena
        .allocate(args.block_size)
        .whatever_context("failed to allocate a block")?
        .whatever_context("block size must not be zero")?;
    println!("{}", unsafe { store_text(block, args.block_size, SHARED_MESSAGE) });

    let array_size = size_of_val(&ARRAY);
    println!("Allocating a {array_size}B block of memory for an array of ints.");
    let array = arena
        .allocate(array_size)
        .whatever_context("failed to allocate an array")?
        .whatever_context("array must not be empty")?;
    unsafe { print_array(array.cast()) };

    println!("Deallocating the initial block.");
    unsafe { arena.deallocate(block.as_ptr()) }
        .whatever_context("failed to deallocate the initial block")?;

    let stats = arena.stats().whatever_context("failed to read arena stats")?;
    println!(
        "{} bytes in {} allocated blocks, {} free blocks, largest free payload {}B.",
        stats.allocated, stats.allocated_blocks, stats.free_blocks, stats.largest_free
    );
    if args.dump {
        for block in arena.blocks().whatever_context("failed to list blocks")? {
            println!(
                "  offset={:#06x} size={:5} {}",
                block.offset, block.size, block.state
            );
        }
    }
    Ok(())
}

/// Copies as much of `text` as fits in `capacity` bytes at `dst` and reads it
/// back.
unsafe fn store_text(dst: NonNull<u8>, capacity: usize, text: &str) -> String {
    let len = text.len().min(capacity);
    unsafe {
        dst.copy_from_nonoverlapping(NonNull::from(text.as_bytes()).cast(), len);
        String::from_utf8_lossy(slice::from_raw_parts(dst.as_ptr(), len)).into_owned()
    }
}

unsafe fn print_array(array: NonNull<i32>) {
    for (i, value) in ARRAY.into_iter().enumerate() {
        unsafe { array.add(i).write(value) };
    }
    for i in 0..ARRAY.len() {
        let value = unsafe { array.add(i).read() };
        println!("Array has value {value} at index {i}");
    }
}
