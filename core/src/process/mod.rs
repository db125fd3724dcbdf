//! Child-process management
//!
//! [`Process`] is the aggregate root of the subsystem: it owns the native
//! handle exclusively, serializes writes to the child's stdin, offers
//! blocking reads from the output streams, and can hand the output
//! streams to a background pump that delivers bytes to caller-supplied
//! sinks as they arrive.
//!
//! ## Teardown order
//!
//! Destruction is sequenced in one place: request cooperative shutdown,
//! join every pump thread, then release the native handle. The pump owns
//! its stream handles outright, so no background thread can ever touch a
//! freed handle.
//!
//! ## Contract
//!
//! All I/O and lifecycle operations except `create` require a live
//! handle. Calling them before `create` or after `destroy` is a defect in
//! the caller and panics; it is not a recoverable error.

use crate::config;
use crate::{CoreError, Result};
use schema::{ProcessExit, ProcessState, PumpState, SpawnOptions, SpawnSpec, StreamKind};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub mod handle;
pub mod pump;

pub use handle::NativeHandle;
pub use pump::{OutputSink, PumpHandle};

const NO_HANDLE: &str = "process accessed before create() or after destroy()";

/// A spawned child process and its I/O surface
///
/// Constructed empty (`Unstarted`) or via the one-shot [`Process::spawn`]
/// which immediately creates the child. A failed `create` leaves the
/// value reusable; a successful one transitions it to `Running`.
#[derive(Debug)]
pub struct Process {
    handle: Option<NativeHandle>,
    destroyed: bool,
    buffer_size: usize,
    stdin_lock: Mutex<()>,
    shutting_down: Arc<AtomicBool>,
    pump: Option<PumpHandle>,
}

impl Default for Process {
    fn default() -> Self {
        Self::new()
    }
}

impl Process {
    /// Create an empty process with the default read chunk size
    pub fn new() -> Self {
        Self::with_buffer_size(schema::DEFAULT_BUFFER_SIZE)
    }

    /// Create an empty process with the given read chunk size
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            handle: None,
            destroyed: false,
            buffer_size,
            stdin_lock: Mutex::new(()),
            shutting_down: Arc::new(AtomicBool::new(false)),
            pump: None,
        }
    }

    /// One-shot constructor: create the child immediately
    pub fn spawn(command: &str, options: SpawnOptions, buffer_size: usize) -> Result<Self> {
        let mut process = Self::with_buffer_size(buffer_size);
        process.create(command, options, &HashMap::new())?;
        Ok(process)
    }

    /// Spawn the child process
    ///
    /// Fails without touching existing state if a handle already exists.
    /// When `environment` is non-empty the child receives exactly the
    /// supplied variables; otherwise inheritance follows the
    /// `INHERIT_ENVIRONMENT` option. A spawn failure leaves the process
    /// reusable for another `create`.
    pub fn create(
        &mut self,
        command: &str,
        options: SpawnOptions,
        environment: &HashMap<String, String>,
    ) -> Result<()> {
        let spec = SpawnSpec {
            command: command.to_string(),
            options,
            environment: environment.clone(),
            working_directory: None,
            buffer_size: self.buffer_size,
        };
        self.create_with_spec(&spec)
    }

    /// Spawn the child process from a full specification
    pub fn create_with_spec(&mut self, spec: &SpawnSpec) -> Result<()> {
        if self.handle.is_some() {
            return Err(CoreError::ValidationError(
                "process already created".to_string(),
            ));
        }
        config::validate_spec(spec)?;

        let handle = NativeHandle::spawn(spec)?;
        self.buffer_size = spec.buffer_size;
        self.destroyed = false;
        self.handle = Some(handle);
        Ok(())
    }

    /// Current lifecycle state
    pub fn state(&self) -> ProcessState {
        match (&self.handle, self.destroyed) {
            (Some(_), _) => {
                if self.is_shutting_down() {
                    ProcessState::ShuttingDown
                } else {
                    ProcessState::Running
                }
            }
            (None, true) => ProcessState::Terminated,
            (None, false) => ProcessState::Unstarted,
        }
    }

    /// Process ID of the child
    pub fn pid(&self) -> u32 {
        self.handle_ref().pid()
    }

    /// Whether the child is still running (non-blocking probe)
    pub fn is_alive(&mut self) -> bool {
        match self.handle_mut().child_mut().try_wait() {
            Ok(None) => true,
            Ok(Some(_)) => false,
            Err(_) => false,
        }
    }

    /// Check for an exit without blocking
    pub fn try_wait(&mut self) -> Result<Option<ProcessExit>> {
        let pid = self.pid();
        let status = self.handle_mut().child_mut().try_wait().map_err(|e| {
            CoreError::ProcessWait(format!("Failed to try_wait for process {pid}: {e}"))
        })?;
        Ok(status.map(|s| exit_record(pid, s)))
    }

    /// Block until the child exits and return its exit record
    pub fn join(&mut self) -> Result<ProcessExit> {
        let pid = self.pid();
        let status = self
            .handle_mut()
            .child_mut()
            .wait()
            .map_err(|e| CoreError::ProcessWait(format!("Failed to wait for process {pid}: {e}")))?;
        Ok(exit_record(pid, status))
    }

    /// Request forced termination (SIGKILL); does not wait for the exit
    ///
    /// Call [`join`](Self::join) afterwards to reap the child. With
    /// `NEW_PROCESS_GROUP` the whole group is signalled. A child or group
    /// that has already exited counts as success.
    pub fn kill(&mut self) -> Result<()> {
        #[cfg(unix)]
        if self
            .handle_ref()
            .options()
            .contains(SpawnOptions::NEW_PROCESS_GROUP)
        {
            return self.signal_group(nix::sys::signal::Signal::SIGKILL);
        }

        let pid = self.pid();
        debug!("Killing process {}", pid);
        match self.handle_mut().child_mut().kill() {
            Ok(()) => Ok(()),
            // Already exited
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(CoreError::ProcessSignal(format!(
                "Failed to kill process {pid}: {e}"
            ))),
        }
    }

    /// Request graceful termination (SIGTERM)
    ///
    /// Falls back to forced termination on platforms without termination
    /// signals. With `NEW_PROCESS_GROUP` the whole group is signalled.
    pub fn terminate(&mut self) -> Result<()> {
        #[cfg(unix)]
        {
            use nix::sys::signal::Signal;
            if self
                .handle_ref()
                .options()
                .contains(SpawnOptions::NEW_PROCESS_GROUP)
            {
                return self.signal_group(Signal::SIGTERM);
            }

            let pid = self.pid();
            debug!("Sending SIGTERM to process {}", pid);
            match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => Ok(()),
                // Already exited
                Err(nix::errno::Errno::ESRCH) => Ok(()),
                Err(e) => Err(CoreError::ProcessSignal(format!(
                    "Failed to send SIGTERM to process {pid}: {e}"
                ))),
            }
        }
        #[cfg(not(unix))]
        {
            self.kill()
        }
    }

    /// Graceful termination with timeout fallback to SIGKILL
    ///
    /// Sends SIGTERM, waits up to `timeout` for the exit, escalates to
    /// SIGKILL and waits again for the kill to take effect.
    pub fn terminate_with_timeout(&mut self, timeout: Duration) -> Result<ProcessExit> {
        self.terminate()?;

        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Some(exit) = self.try_wait()? {
                debug!("Process {} exited gracefully: {:?}", exit.pid, exit);
                return Ok(exit);
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        warn!(
            "Process {} did not exit gracefully within {:?}, using SIGKILL",
            self.pid(),
            timeout
        );
        self.kill()?;

        let kill_timeout = Duration::from_secs(5);
        let kill_start = Instant::now();
        while kill_start.elapsed() < kill_timeout {
            if let Some(exit) = self.try_wait()? {
                return Ok(exit);
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        Err(CoreError::ProcessWait(format!(
            "Process {} did not exit even after SIGKILL within {:?}",
            self.pid(),
            kill_timeout
        )))
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: nix::sys::signal::Signal) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        let pid = self.handle_ref().pid();
        let pgid = Pid::from_raw(pid as i32);
        debug!("Sending {} to process group {}", signal, pgid);
        match killpg(pgid, signal) {
            Ok(()) => Ok(()),
            // Group already exited, or changed ownership on its way out
            Err(Errno::ESRCH) | Err(Errno::EPERM) => {
                debug!("Process group {} already exited", pgid);
                Ok(())
            }
            Err(e) => Err(CoreError::ProcessSignal(format!(
                "Failed to send {signal} to process group {pgid}: {e}"
            ))),
        }
    }

    /// Write to the child's stdin
    ///
    /// Writes are serialized by the stdin lock: bytes from concurrent
    /// callers never interleave within a single call. The whole buffer is
    /// written; the returned count equals `buffer.len()`.
    pub fn write(&self, buffer: &[u8]) -> Result<usize> {
        let handle = self.handle_ref();
        let _guard = self.stdin_lock.lock().expect("stdin lock poisoned");
        let Some(stdin) = handle.stdin() else {
            panic!("stdin stream is not available");
        };
        let mut writer: &File = stdin;
        writer.write_all(buffer)?;
        Ok(buffer.len())
    }

    /// Write a string to the child's stdin
    pub fn write_str(&self, buffer: &str) -> Result<usize> {
        self.write(buffer.as_bytes())
    }

    /// Close the child's stdin, delivering end-of-stream
    ///
    /// A child that reads its input to completion (`cat`, filters) exits
    /// only after this. Subsequent writes are contract violations.
    pub fn close_stdin(&mut self) {
        assert!(self.handle.is_some(), "{}", NO_HANDLE);
        let _guard = self.stdin_lock.lock().expect("stdin lock poisoned");
        if let Some(handle) = self.handle.as_mut() {
            drop(handle.close_stdin());
        }
    }

    /// One blocking read from the child's stdout
    ///
    /// Returns `Ok(0)` at end-of-stream; may return fewer bytes than the
    /// buffer holds. Interrupted reads are retried locally.
    pub fn read_stdout(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let handle = self.handle_ref();
        let Some(stream) = handle.stdout() else {
            panic!("stdout stream is not available (claimed by async reader)");
        };
        read_retrying(stream, buffer)
    }

    /// One blocking read from the child's stderr
    pub fn read_stderr(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let handle = self.handle_ref();
        let Some(stream) = handle.stderr() else {
            panic!("stderr stream is not available (combined output or claimed by async reader)");
        };
        read_retrying(stream, buffer)
    }

    /// Read the child's stdout to end-of-stream, appending to `buffer`
    ///
    /// Issues chunked reads of the configured buffer size. A child that
    /// exited has its pipe closed, so buffered output drains and the call
    /// returns exactly what the child wrote. A child that neither closes
    /// its stream nor exits blocks this call indefinitely, bounded only
    /// by the shutdown check between reads.
    pub fn read_all_stdout(&mut self, buffer: &mut Vec<u8>) -> Result<usize> {
        self.read_all(StreamKind::Stdout, buffer)
    }

    /// Read the child's stderr to end-of-stream, appending to `buffer`
    pub fn read_all_stderr(&mut self, buffer: &mut Vec<u8>) -> Result<usize> {
        self.read_all(StreamKind::Stderr, buffer)
    }

    fn read_all(&mut self, kind: StreamKind, buffer: &mut Vec<u8>) -> Result<usize> {
        let mut chunk = vec![0u8; self.buffer_size];
        let mut total = 0;
        loop {
            let bytes_read = match kind {
                StreamKind::Stdout => self.read_stdout(&mut chunk)?,
                StreamKind::Stderr => self.read_stderr(&mut chunk)?,
            };
            if bytes_read > 0 {
                buffer.extend_from_slice(&chunk[..bytes_read]);
                total += bytes_read;
            }
            if bytes_read == 0 || self.is_shutting_down() {
                break;
            }
        }
        Ok(total)
    }

    /// Register sinks and start the background output pump
    ///
    /// Takes exclusive ownership of the output streams; subsequent
    /// synchronous reads of those streams are contract violations. May be
    /// called once per created handle. Bytes are delivered to each sink
    /// in the order received from the OS; stdout and stderr are
    /// independent channels with no cross-stream ordering.
    pub fn start_async_read<F, G>(&mut self, on_stdout: F, on_stderr: G) -> Result<()>
    where
        F: FnMut(&[u8]) + Send + 'static,
        G: FnMut(&[u8]) + Send + 'static,
    {
        assert!(
            self.pump.is_none(),
            "async read already started for this process"
        );
        let handle = match self.handle.as_mut() {
            Some(handle) => handle,
            None => panic!("{}", NO_HANDLE),
        };
        let stdout = handle.take_stdout();
        let stderr = handle.take_stderr();
        let pump = pump::start(
            stdout,
            stderr,
            Box::new(on_stdout),
            Box::new(on_stderr),
            self.buffer_size,
            Arc::clone(&self.shutting_down),
        )?;
        self.pump = Some(pump);
        Ok(())
    }

    /// Current pump state; `Idle` when no sinks are registered
    pub fn pump_state(&self) -> PumpState {
        self.pump
            .as_ref()
            .map(PumpHandle::state)
            .unwrap_or(PumpState::Idle)
    }

    /// Request cooperative shutdown
    ///
    /// Non-blocking; sets a monotonic flag observed by the pump loops and
    /// by `read_all_*` between reads. The flag is never reset, not even
    /// by a later `create`.
    pub fn start_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    /// Whether cooperative shutdown has been requested
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Release the native handle after stopping the pump
    ///
    /// Requests shutdown, joins every pump thread, then drops the handle;
    /// the state becomes `Terminated`. At most once per handle; dropping
    /// the process performs the same sequence if this was not called.
    pub fn destroy(&mut self) {
        assert!(self.handle.is_some(), "{}", NO_HANDLE);
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.handle.is_none() && self.pump.is_none() {
            return;
        }
        self.shutting_down.store(true, Ordering::Release);
        if let Some(mut pump) = self.pump.take() {
            pump.join();
        }
        if let Some(handle) = self.handle.take() {
            debug!("Destroying process {}", handle.pid());
            self.destroyed = true;
        }
    }

    /// Raw stdin handle for host interop, if not taken
    pub fn stdin(&self) -> Option<&File> {
        self.handle_ref().stdin()
    }

    /// Raw stdout handle for host interop, if not claimed by the pump
    pub fn stdout(&self) -> Option<&File> {
        self.handle_ref().stdout()
    }

    /// Raw stderr handle for host interop
    ///
    /// Absent under combined output or when claimed by the pump.
    pub fn stderr(&self) -> Option<&File> {
        self.handle_ref().stderr()
    }

    fn handle_ref(&self) -> &NativeHandle {
        match &self.handle {
            Some(handle) => handle,
            None => panic!("{}", NO_HANDLE),
        }
    }

    fn handle_mut(&mut self) -> &mut NativeHandle {
        match &mut self.handle {
            Some(handle) => handle,
            None => panic!("{}", NO_HANDLE),
        }
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Map an exit status to the schema exit record
fn exit_record(pid: u32, status: ExitStatus) -> ProcessExit {
    let (exit_code, signal) = if let Some(code) = status.code() {
        (Some(code), None)
    } else {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            (None, status.signal())
        }
        #[cfg(not(unix))]
        {
            (None, None)
        }
    };
    ProcessExit {
        pid,
        exit_code,
        signal,
    }
}

/// Blocking read retried on interruption
fn read_retrying(mut stream: &File, buffer: &mut [u8]) -> Result<usize> {
    loop {
        match stream.read(buffer) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
