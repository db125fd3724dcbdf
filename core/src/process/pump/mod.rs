//! Asynchronous output pump
//!
//! The pump moves bytes from a child's output streams to caller-supplied
//! sinks on background threads. Two functionally equivalent backends sit
//! behind the same interface, selected at build time:
//!
//! - **Unix**: a single thread multiplexes both streams with `poll(2)`
//!   over non-blocking descriptors.
//! - **Windows**: one thread per stream issues blocking reads of the
//!   configured chunk size.
//!
//! The pump owns its stream handles outright; they are moved in at
//! registration time, so the native handle can never be released while a
//! pump thread still reads from it.

use crate::Result;
use schema::PumpState;
use std::fs::File;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::warn;

#[cfg(unix)]
pub mod unix;
#[cfg(windows)]
pub mod windows;

#[cfg(unix)]
use unix as backend;
#[cfg(windows)]
use windows as backend;

/// Byte-consuming callback receiving chunks as they arrive from the OS
pub type OutputSink = Box<dyn FnMut(&[u8]) + Send + 'static>;

const STATE_ARMED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// State shared between the owning process and the pump threads
pub(crate) struct PumpShared {
    state: AtomicU8,
    active: AtomicUsize,
}

impl PumpShared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_ARMED),
            active: AtomicUsize::new(0),
        }
    }

    /// Record how many background contexts will run
    pub(crate) fn arm(&self, contexts: usize) {
        self.active.store(contexts, Ordering::Release);
    }

    /// Called by each context as it starts pumping
    pub(crate) fn enter(&self) {
        self.state.store(STATE_RUNNING, Ordering::Release);
    }

    /// Called by each context as it exits; the last one out stops the pump
    pub(crate) fn exit(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.state.store(STATE_STOPPED, Ordering::Release);
        }
    }

    /// Mark the pump stopped without any context having run
    pub(crate) fn mark_stopped(&self) {
        self.state.store(STATE_STOPPED, Ordering::Release);
    }

    fn state(&self) -> PumpState {
        match self.state.load(Ordering::Acquire) {
            STATE_ARMED => PumpState::Armed,
            STATE_RUNNING => PumpState::Running,
            _ => PumpState::Stopped,
        }
    }
}

/// Handle to the running pump contexts
///
/// Owned by the process; joined before the native handle is released.
pub struct PumpHandle {
    threads: Vec<JoinHandle<()>>,
    shared: Arc<PumpShared>,
}

impl PumpHandle {
    /// Current pump state
    pub fn state(&self) -> PumpState {
        self.shared.state()
    }

    /// Block until every pump thread has exited
    pub(crate) fn join(&mut self) {
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("Pump thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for PumpHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PumpHandle")
            .field("state", &self.state())
            .field("threads", &self.threads.len())
            .finish()
    }
}

/// Arm the pump and start the platform backend
///
/// Streams that are absent (a combined-output child has no stderr) are
/// simply not monitored. With no streams at all the pump reports
/// `Stopped` immediately.
pub(crate) fn start(
    stdout: Option<File>,
    stderr: Option<File>,
    on_stdout: OutputSink,
    on_stderr: OutputSink,
    buffer_size: usize,
    shutdown: Arc<AtomicBool>,
) -> Result<PumpHandle> {
    let shared = Arc::new(PumpShared::new());
    let threads = backend::spawn_pump(
        stdout,
        stderr,
        on_stdout,
        on_stderr,
        buffer_size,
        shutdown,
        Arc::clone(&shared),
    )?;
    Ok(PumpHandle { threads, shared })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::handle::into_stream;
    use std::io::Write;
    use std::sync::Mutex;

    fn collector() -> (Arc<Mutex<Vec<u8>>>, OutputSink) {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink_target = Arc::clone(&collected);
        let sink: OutputSink = Box::new(move |bytes| {
            sink_target.lock().unwrap().extend_from_slice(bytes);
        });
        (collected, sink)
    }

    #[test]
    fn test_pump_delivers_bytes_until_eof() {
        let (reader, mut writer) = std::io::pipe().unwrap();
        let (collected, sink) = collector();
        let (_, null_sink) = collector();

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut pump = start(
            Some(into_stream(reader)),
            None,
            sink,
            null_sink,
            16,
            shutdown,
        )
        .unwrap();

        writer.write_all(b"first").unwrap();
        writer.write_all(b" second").unwrap();
        drop(writer); // end-of-stream stops the pump

        pump.join();
        assert_eq!(pump.state(), PumpState::Stopped);
        assert_eq!(collected.lock().unwrap().as_slice(), b"first second");
    }

    #[test]
    fn test_pump_without_streams_is_stopped() {
        let (_, out_sink) = collector();
        let (_, err_sink) = collector();
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut pump = start(None, None, out_sink, err_sink, 16, shutdown).unwrap();
        pump.join();
        assert_eq!(pump.state(), PumpState::Stopped);
    }

    #[test]
    fn test_pump_preserves_order_within_stream() {
        let (reader, mut writer) = std::io::pipe().unwrap();
        let (collected, sink) = collector();
        let (_, null_sink) = collector();
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut pump = start(
            Some(into_stream(reader)),
            None,
            sink,
            null_sink,
            4, // force several chunked dispatches
            shutdown,
        )
        .unwrap();

        writer.write_all(b"abcdefghijklmnop").unwrap();
        drop(writer);

        pump.join();
        assert_eq!(collected.lock().unwrap().as_slice(), b"abcdefghijklmnop");
    }
}
