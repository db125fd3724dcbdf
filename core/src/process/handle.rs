//! Native process handle: the OS process and its stream set
//!
//! [`NativeHandle`] owns the spawned child and the parent-side ends of its
//! standard streams. Streams are held as plain [`File`]s on both platforms
//! so the synchronous read path, the pump backends and host interop all
//! work against one type.

use crate::command;
use crate::{CoreError, Result};
use schema::{SpawnOptions, SpawnSpec};
use std::fs::File;
use std::io;
use std::process::{Child, Command, Stdio};
use tracing::{debug, error};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Convert a child stream or pipe end into a [`File`]
#[cfg(unix)]
pub(crate) fn into_stream<T: Into<std::os::fd::OwnedFd>>(stream: T) -> File {
    File::from(stream.into())
}

#[cfg(windows)]
pub(crate) fn into_stream<T: Into<std::os::windows::io::OwnedHandle>>(stream: T) -> File {
    File::from(stream.into())
}

/// Owner of the OS process and the parent-side stream handles
///
/// Created once by [`NativeHandle::spawn`] and dropped exactly once when
/// the owning process releases it. The output streams can be taken
/// individually, which is how the async pump claims exclusive ownership
/// of them.
#[derive(Debug)]
pub struct NativeHandle {
    child: Child,
    pid: u32,
    options: SpawnOptions,
    stdin: Option<File>,
    stdout: Option<File>,
    stderr: Option<File>,
}

impl NativeHandle {
    /// Spawn a child process according to the given specification
    ///
    /// The command line is tokenized honoring double quotes. A non-empty
    /// environment replaces inheritance entirely; otherwise inheritance
    /// follows the `INHERIT_ENVIRONMENT` flag. All three standard streams
    /// are piped; under `COMBINED_STDOUT_STDERR` a single anonymous pipe
    /// carries both output streams and no separate stderr handle exists.
    pub fn spawn(spec: &SpawnSpec) -> Result<NativeHandle> {
        let argv = command::split_command(&spec.command)?;
        command::validate_environment(&spec.environment)?;

        debug!("Spawning process: {:?}", argv);

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);

        if !spec.environment.is_empty() {
            // Explicit environment replaces inheritance entirely
            cmd.env_clear();
            cmd.envs(&spec.environment);
        } else if !spec.options.contains(SpawnOptions::INHERIT_ENVIRONMENT) {
            cmd.env_clear();
        }

        if let Some(dir) = &spec.working_directory {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::piped());

        let mut combined_reader = None;
        if spec.options.contains(SpawnOptions::COMBINED_STDOUT_STDERR) {
            let (reader, writer) = io::pipe()?;
            let stderr_writer = writer.try_clone()?;
            cmd.stdout(Stdio::from(writer));
            cmd.stderr(Stdio::from(stderr_writer));
            combined_reader = Some(reader);
        } else {
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        }

        #[cfg(unix)]
        if spec.options.contains(SpawnOptions::NEW_PROCESS_GROUP) {
            use std::os::unix::process::CommandExt;
            // Safety: setsid() is async-signal-safe and appropriate for
            // use in pre_exec
            #[allow(unsafe_code)]
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        #[cfg(windows)]
        if spec.options.contains(SpawnOptions::NO_WINDOW) {
            use std::os::windows::process::CommandExt;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn process '{}': {}", argv[0], e);
            CoreError::ProcessSpawn(format!("Failed to spawn '{}': {e}", argv[0]))
        })?;

        let pid = child.id();
        let stdin = child.stdin.take().map(into_stream);
        let (stdout, stderr) = match combined_reader {
            Some(reader) => (Some(into_stream(reader)), None),
            None => (
                child.stdout.take().map(into_stream),
                child.stderr.take().map(into_stream),
            ),
        };

        debug!("Successfully spawned process {}", pid);

        Ok(NativeHandle {
            child,
            pid,
            options: spec.options,
            stdin,
            stdout,
            stderr,
        })
    }

    /// Process ID of the child
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Options the child was spawned with
    pub fn options(&self) -> SpawnOptions {
        self.options
    }

    pub(crate) fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }

    /// Parent-side handle to the child's stdin, if not taken
    pub fn stdin(&self) -> Option<&File> {
        self.stdin.as_ref()
    }

    /// Parent-side handle to the child's stdout, if not claimed
    pub fn stdout(&self) -> Option<&File> {
        self.stdout.as_ref()
    }

    /// Parent-side handle to the child's stderr, if not claimed
    ///
    /// Absent when the child was spawned with `COMBINED_STDOUT_STDERR`.
    pub fn stderr(&self) -> Option<&File> {
        self.stderr.as_ref()
    }

    /// Drop the parent-side stdin handle, delivering end-of-stream to the
    /// child's standard input
    pub(crate) fn close_stdin(&mut self) -> Option<File> {
        self.stdin.take()
    }

    /// Take exclusive ownership of the stdout stream
    pub(crate) fn take_stdout(&mut self) -> Option<File> {
        self.stdout.take()
    }

    /// Take exclusive ownership of the stderr stream
    pub(crate) fn take_stderr(&mut self) -> Option<File> {
        self.stderr.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn test_spawn_simple_command() {
        let spec = SpawnSpec::new("true").options(SpawnOptions::INHERIT_ENVIRONMENT);
        let mut handle = NativeHandle::spawn(&spec).expect("Failed to spawn true");
        assert!(handle.pid() > 0);
        assert!(handle.stdin().is_some());
        assert!(handle.stdout().is_some());
        assert!(handle.stderr().is_some());

        let status = handle.child_mut().wait().expect("Failed to wait");
        assert!(status.success());
    }

    #[test]
    fn test_spawn_nonexistent_command() {
        let spec = SpawnSpec::new("nonexistent_command_12345");
        let result = NativeHandle::spawn(&spec);
        match result.unwrap_err() {
            CoreError::ProcessSpawn(_) => {}
            e => panic!("Expected ProcessSpawn error, got: {e}"),
        }
    }

    #[test]
    fn test_spawn_empty_command() {
        let spec = SpawnSpec::new("");
        match NativeHandle::spawn(&spec).unwrap_err() {
            CoreError::ValidationError(_) => {}
            e => panic!("Expected ValidationError, got: {e}"),
        }
    }

    #[test]
    #[cfg(unix)]
    fn test_combined_output_has_no_stderr_stream() {
        let spec = SpawnSpec::new("true")
            .options(SpawnOptions::INHERIT_ENVIRONMENT | SpawnOptions::COMBINED_STDOUT_STDERR);
        let mut handle = NativeHandle::spawn(&spec).expect("Failed to spawn true");
        assert!(handle.stdout().is_some());
        assert!(handle.stderr().is_none());
        let _ = handle.child_mut().wait();
    }
}
