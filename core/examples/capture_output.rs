//! Simple demonstration of the process subsystem
//!
//! Spawns a short shell pipeline, streams its output through the async
//! pump, and tears everything down in order.

use procyon_core::{Process, Result, SpawnOptions};
use std::collections::HashMap;
use std::io::Write;
use tracing::info;

fn main() -> Result<()> {
    procyon_core::utils::init_tracing("info");

    info!("Spawning child process");

    let mut process = Process::new();
    process.create(
        "/bin/sh -c \"echo starting; echo warning 1>&2; echo done\"",
        SpawnOptions::empty(),
        &HashMap::new(),
    )?;
    info!("Child pid: {}", process.pid());

    process.start_async_read(
        |bytes| {
            print!("[stdout] ");
            std::io::stdout().write_all(bytes).ok();
        },
        |bytes| {
            print!("[stderr] ");
            std::io::stdout().write_all(bytes).ok();
        },
    )?;

    let exit = process.join()?;
    info!("Child exited: {:?}", exit);

    // Drop stops the pump and releases the handle in order; being explicit
    // here to show the teardown call
    process.destroy();

    Ok(())
}
