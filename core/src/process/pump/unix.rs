//! Poll-multiplexed pump backend for POSIX platforms
//!
//! One background thread places both output descriptors into non-blocking
//! mode and waits, with no timeout, on `poll(2)` for either to become
//! readable or to hang up. On readiness it performs one bounded read and
//! dispatches the bytes to the sink matching the stream's tag. A
//! descriptor reporting error, hang-up or invalidity is excluded from
//! further waiting; the loop exits once no descriptor remains eligible or
//! the shutdown flag is observed.

use super::{OutputSink, PumpShared};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use schema::StreamKind;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use tracing::{debug, warn};

/// One monitored output stream and its sink
struct MonitoredStream {
    kind: StreamKind,
    file: File,
    sink: OutputSink,
    open: bool,
}

/// Spawn the single multiplexing thread
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
    let mut streams = Vec::with_capacity(2);
    if let Some(file) = stdout {
        streams.push(MonitoredStream {
            kind: StreamKind::Stdout,
            file,
            sink: on_stdout,
            open: true,
        });
    }
    if let Some(file) = stderr {
        streams.push(MonitoredStream {
            kind: StreamKind::Stderr,
            file,
            sink: on_stderr,
            open: true,
        });
    }

    if streams.is_empty() {
        shared.mark_stopped();
        return Ok(Vec::new());
    }

    shared.arm(1);
    let handle = Builder::new()
        .name("procyon-pump".to_string())
        .spawn(move || {
            shared.enter();
            run(streams, buffer_size, &shutdown);
            shared.exit();
        })?;

    Ok(vec![handle])
}

fn run(mut streams: Vec<MonitoredStream>, buffer_size: usize, shutdown: &AtomicBool) {
    for stream in &streams {
        if let Err(e) = set_nonblocking(&stream.file) {
            warn!("Failed to set {:?} non-blocking: {}", stream.kind, e);
        }
    }

    let mut buffer = vec![0u8; buffer_size];
    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Pump observed shutdown request");
            break;
        }

        let open: Vec<usize> = streams
            .iter()
            .enumerate()
            .filter(|(_, s)| s.open)
            .map(|(i, _)| i)
            .collect();
        if open.is_empty() {
            break;
        }

        let mut fds: Vec<PollFd> = open
            .iter()
            .map(|&i| PollFd::new(streams[i].file.as_fd(), PollFlags::POLLIN))
            .collect();
        let events: Vec<PollFlags> = match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => fds
                .iter()
                .map(|fd| fd.revents().unwrap_or(PollFlags::empty()))
                .collect(),
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!("poll failed: {}", e);
                break;
            }
        };
        drop(fds);

        for (&i, revents) in open.iter().zip(&events) {
            let stream = &mut streams[i];
            let mut produced = false;
            if revents.contains(PollFlags::POLLIN) {
                // One bounded read per readiness wake
                match stream.file.read(&mut buffer) {
                    Ok(0) => {
                        stream.open = false;
                        continue;
                    }
                    Ok(n) => {
                        (stream.sink)(&buffer[..n]);
                        produced = true;
                    }
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                        ) => {}
                    Err(e) => {
                        warn!("Error reading {:?}: {}", stream.kind, e);
                        stream.open = false;
                        continue;
                    }
                }
            }
            // A hung-up descriptor keeps its slot while reads still produce
            // bytes; it is excluded on the first wake that drains nothing,
            // after buffered output has been delivered in order.
            if !produced
                && revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL)
            {
                stream.open = false;
            }
        }
    }
}

fn set_nonblocking(file: &File) -> nix::Result<()> {
    let flags = fcntl(file.as_fd(), FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(file.as_fd(), FcntlArg::F_SETFL(flags))?;
    Ok(())
}
