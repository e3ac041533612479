//! Keeps stray writes to stdout away from the protocol stream.
//!
//! The protocol owns a duplicate of file descriptor 1. The original descriptor
//! is then pointed at a pipe, and every line written into it (by `println!`, a
//! C library, anything) is re-emitted as a `tracing` event on the
//! `multilang::stdout` target.
//!
//! Stdin is read on a dedicated thread as well, so a pending read never keeps
//! the async runtime from shutting down once the component stops.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::os::fd::{FromRawFd, RawFd};
use std::thread;

use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

const STDOUT_FD: RawFd = 1;

/// Size of the chunks moved from stdin into the protocol reader.
const INPUT_CHUNK_SIZE: usize = 64 * 1024;

fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Redirects fd 1 into the logging path and returns the file the protocol
/// must write to from now on.
pub(crate) fn redirect_stdout() -> io::Result<File> {
    // SAFETY: plain descriptor juggling, every returned descriptor is checked
    // and ends up owned by exactly one `File`.
    unsafe {
        let protocol_fd = check(libc::fcntl(STDOUT_FD, libc::F_DUPFD_CLOEXEC, 0))?;
        let protocol = File::from_raw_fd(protocol_fd);

        let mut fds: [libc::c_int; 2] = [0; 2];
        check(libc::pipe(fds.as_mut_ptr()))?;
        let pipe_reader = File::from_raw_fd(fds[0]);
        let pipe_writer = File::from_raw_fd(fds[1]);

        check(libc::dup2(fds[1], STDOUT_FD))?;
        // fd 1 now holds its own reference to the pipe
        drop(pipe_writer);

        forward_lines(pipe_reader)?;
        Ok(protocol)
    }
}

/// Spawns the thread that turns captured output into log events. The thread
/// ends when every writer of the pipe is gone and returns the number of lines seen.
fn forward_lines<R>(source: R) -> io::Result<thread::JoinHandle<usize>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name("multilang-stdout".into())
        .spawn(move || {
            let mut forwarded = 0;
            for line in BufReader::new(source).lines() {
                match line {
                    Ok(line) => {
                        info!(target: "multilang::stdout", "{}", line);
                        forwarded += 1;
                    }
                    Err(e) => {
                        warn!(error = ?e, "Stopped capturing stdout");
                        break;
                    }
                }
            }
            forwarded
        })
}

/// Returns an async reader fed from the process' stdin.
pub(crate) fn stdin_reader(handle: Handle) -> io::Result<DuplexStream> {
    forward_input(io::stdin(), handle)
}

/// Pumps `source` into an in-memory pipe on a plain thread. The thread is not
/// part of the runtime's blocking pool, so dropping the runtime never waits on
/// a read that is still pending. The thread ends at end of input or once the
/// returned reader is dropped and the next chunk cannot be delivered.
fn forward_input<R>(mut source: R, handle: Handle) -> io::Result<DuplexStream>
where
    R: Read + Send + 'static,
{
    let (reader, mut writer) = tokio::io::duplex(INPUT_CHUNK_SIZE);
    thread::Builder::new()
        .name("multilang-stdin".into())
        .spawn(move || {
            let mut buf = vec![0u8; INPUT_CHUNK_SIZE];
            loop {
                let n = match source.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(error = ?e, "Stopped reading stdin");
                        break;
                    }
                };
                if let Err(e) = handle.block_on(writer.write_all(&buf[..n])) {
                    debug!(error = ?e, "Protocol reader is gone, no longer forwarding stdin");
                    break;
                }
            }
            // EOF for the reader
            let _ = handle.block_on(writer.shutdown());
        })?;
    Ok(reader)
}
