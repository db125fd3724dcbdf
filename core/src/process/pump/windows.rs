//! Per-stream pump backend for Windows
//!
//! One background thread per output stream issues blocking reads of the
//! configured chunk size against the pipe handle. A successful read with
//! a nonzero byte count dispatches to the sink and loops; a zero-byte
//! read or a failure exits the loop.
//!
//! The shutdown flag is checked at each loop head only. A read that is
//! blocked waiting for data the child never sends is not preempted; this
//! is a known liveness gap of the handle-based strategy. Callers that
//! need a hard deadline must terminate the child to unblock the read.

use super::{OutputSink, PumpShared};
use schema::StreamKind;
use std::fs::File;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use tracing::warn;

/// Spawn one reader thread per present stream
#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn_pump(
    stdout: Option<File>,
    stderr: Option<File>,
    on_stdout: OutputSink,
    on_stderr: OutputSink,
    buffer_size: usize,
    shutdown: Arc<AtomicBool>,
    shared: Arc<PumpShared>,
) -> io::Result<Vec<JoinHandle<()>>> {
    let mut planned = Vec::with_capacity(2);
    if let Some(file) = stdout {
        planned.push((StreamKind::Stdout, file, on_stdout));
    }
    if let Some(file) = stderr {
        planned.push((StreamKind::Stderr, file, on_stderr));
    }

    if planned.is_empty() {
        shared.mark_stopped();
        return Ok(Vec::new());
    }

    shared.arm(planned.len());
    let mut threads = Vec::with_capacity(planned.len());
    for (kind, file, sink) in planned {
        let name = match kind {
            StreamKind::Stdout => "procyon-pump-stdout",
            StreamKind::Stderr => "procyon-pump-stderr",
        };
        let shutdown = Arc::clone(&shutdown);
        let shared = Arc::clone(&shared);
        let spawned = Builder::new().name(name.to_string()).spawn(move || {
            shared.enter();
            run_stream(kind, file, sink, buffer_size, &shutdown);
            shared.exit();
        });
        match spawned {
            Ok(handle) => threads.push(handle),
            Err(e) => {
                // Release the slot the failed context would have occupied
                // so the pump still reports Stopped once the others exit.
                warn!("Failed to spawn {:?} pump thread: {}", kind, e);
                shared.exit();
            }
        }
    }

    Ok(threads)
}

fn run_stream(
    kind: StreamKind,
    mut file: File,
    mut sink: OutputSink,
    buffer_size: usize,
    shutdown: &AtomicBool,
) {
    let mut buffer = vec![0u8; buffer_size];
    while !shutdown.load(Ordering::Relaxed) {
        match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => sink(&buffer[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Error reading {:?}: {}", kind, e);
                break;
            }
        }
    }
}
