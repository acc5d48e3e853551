//! Runs one job attempt, optionally inside a forked child process so a
//! crash (SIGSEGV, SIGABRT) in the job cannot take the worker down with
//! it. Captures stdout/stderr into scratch files keyed by the job's uuid,
//! reading them back into the record once the attempt finishes.

use std::fs::File;
use std::io::{Read, Write};
use std::panic::AssertUnwindSafe;

use crate::registry::JobObject;
use crate::worker::JobStatus;

/// Everything the worker needs to update the job record after an attempt.
pub struct AttemptOutput {
    pub status: JobStatus,
    pub stdout: String,
    pub stderr: String,
    pub last_exception: Option<String>,
}

/// Run one attempt of `job`. When `fork_to_handle` is true and the
/// platform supports it, runs inside a forked child so native crashes are
/// contained; otherwise runs in-process with streams redirected for the
/// duration of the call and restored afterward on every exit path.
pub fn run_attempt(job: &mut dyn JobObject, uuid: &str, fork_to_handle: bool) -> AttemptOutput {
    let stdout_path = uuid.to_string();
    let stderr_path = format!("{}.stderr", uuid);

    #[cfg(unix)]
    if fork_to_handle {
        return run_forked(job, &stdout_path, &stderr_path);
    }

    let _ = fork_to_handle;
    run_in_process(job, &stdout_path, &stderr_path)
}

fn run_in_process(job: &mut dyn JobObject, stdout_path: &str, stderr_path: &str) -> AttemptOutput {
    let stdout_file = match scratch_file(stdout_path) {
        Ok(f) => f,
        Err(e) => return scratch_file_failure(stdout_path, e),
    };
    let stderr_file = match scratch_file(stderr_path) {
        Ok(f) => f,
        Err(e) => return scratch_file_failure(stderr_path, e),
    };

    let (status, last_exception) = {
        #[cfg(unix)]
        let _guard = unix_redirect::StreamRedirectGuard::new(&stdout_file, &stderr_file);

        match std::panic::catch_unwind(AssertUnwindSafe(|| job.handle())) {
            Ok(Ok(())) => (JobStatus::NoError, None),
            Ok(Err(e)) => (JobStatus::ErrExcept, Some(e.to_string())),
            Err(panic) => (JobStatus::ErrExcept, Some(panic_message(&panic))),
        }
    };

    let (stdout, stderr) = read_and_remove(stdout_path, stderr_path);
    AttemptOutput {
        status,
        stdout,
        stderr,
        last_exception,
    }
}

#[cfg(unix)]
fn run_forked(job: &mut dyn JobObject, stdout_path: &str, stderr_path: &str) -> AttemptOutput {
    use std::os::unix::io::AsRawFd;

    let stdout_file = match scratch_file(stdout_path) {
        Ok(f) => f,
        Err(e) => return scratch_file_failure(stdout_path, e),
    };
    let stderr_file = match scratch_file(stderr_path) {
        Ok(f) => f,
        Err(e) => return scratch_file_failure(stderr_path, e),
    };

    // Safety: fork() duplicates the whole process; the child only ever
    // touches its own fds and calls `handle`/`exit`, never unwinding back
    // into the parent's stack.
    let pid = unsafe { libc::fork() };

    match pid {
        -1 => AttemptOutput {
            status: JobStatus::ErrExcept,
            stdout: String::new(),
            stderr: String::new(),
            last_exception: Some("fork failed".to_string()),
        },
        0 => {
            let _guard = unix_redirect::StreamRedirectGuard::new(&stdout_file, &stderr_file);
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| job.handle()));
            unsafe {
                libc::fflush(std::ptr::null_mut());
            }
            let code = match result {
                Ok(Ok(())) => 0,
                _ => 1,
            };
            let _ = stdout_file.as_raw_fd();
            std::process::exit(code);
        }
        child_pid => {
            let mut wait_status: libc::c_int = 0;
            // Safety: `child_pid` was just returned by `fork` above and is
            // waited on exactly once.
            unsafe {
                libc::waitpid(child_pid, &mut wait_status, 0);
            }

            let status = if libc::WIFEXITED(wait_status) && libc::WEXITSTATUS(wait_status) == 0 {
                JobStatus::NoError
            } else {
                JobStatus::ErrorRetry
            };

            let (stdout, stderr) = read_and_remove(stdout_path, stderr_path);
            AttemptOutput {
                status,
                stdout,
                stderr,
                last_exception: None,
            }
        }
    }
}

fn scratch_file(path: &str) -> std::io::Result<File> {
    File::create(path)
}

/// An I/O failure opening a scratch file (disk full, permission denied, ...)
/// is just another way an attempt can fail - it must not panic the worker,
/// which is exactly what the process isolator exists to prevent.
fn scratch_file_failure(path: &str, e: std::io::Error) -> AttemptOutput {
    AttemptOutput {
        status: JobStatus::ErrExcept,
        stdout: String::new(),
        stderr: String::new(),
        last_exception: Some(format!("failed to create scratch file {}: {}", path, e)),
    }
}

fn read_and_remove(stdout_path: &str, stderr_path: &str) -> (String, String) {
    let stdout = read_then_delete(stdout_path);
    let stderr = read_then_delete(stderr_path);
    (stdout, stderr)
}

fn read_then_delete(path: &str) -> String {
    let mut contents = String::new();
    if let Ok(mut file) = File::open(path) {
        let _ = file.read_to_string(&mut contents);
    }
    let _ = std::fs::remove_file(path);
    contents
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "job panicked".to_string()
    }
}

#[cfg(unix)]
mod unix_redirect {
    use std::fs::File;
    use std::os::unix::io::AsRawFd;

    /// Redirects fd 1/2 to the given files for the lifetime of the guard,
    /// restoring the originals on drop - including during an unwind, so a
    /// panicking job still leaves stdout/stderr intact for the worker.
    pub struct StreamRedirectGuard {
        saved_stdout: libc::c_int,
        saved_stderr: libc::c_int,
    }

    impl StreamRedirectGuard {
        pub fn new(stdout_file: &File, stderr_file: &File) -> Self {
            let saved_stdout = unsafe { libc::dup(libc::STDOUT_FILENO) };
            let saved_stderr = unsafe { libc::dup(libc::STDERR_FILENO) };

            unsafe {
                libc::dup2(stdout_file.as_raw_fd(), libc::STDOUT_FILENO);
                libc::dup2(stderr_file.as_raw_fd(), libc::STDERR_FILENO);
            }

            StreamRedirectGuard {
                saved_stdout,
                saved_stderr,
            }
        }
    }

    impl Drop for StreamRedirectGuard {
        fn drop(&mut self) {
            unsafe {
                libc::dup2(self.saved_stdout, libc::STDOUT_FILENO);
                libc::dup2(self.saved_stderr, libc::STDERR_FILENO);
                libc::close(self.saved_stdout);
                libc::close(self.saved_stderr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Job;
    use serde_json::{json, Value};

    #[derive(Debug, Default)]
    struct Noisy;

    impl Job for Noisy {
        const NAME: &'static str = "Noisy";

        fn handle(&mut self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
            println!("hello from job");
            Ok(())
        }

        fn to_data(&self) -> Value {
            json!({})
        }

        fn from_data(_data: &Value) -> Self {
            Noisy
        }
    }

    #[derive(Debug, Default)]
    struct Boom;

    impl Job for Boom {
        const NAME: &'static str = "Boom";

        fn handle(&mut self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Err("kaboom".into())
        }

        fn to_data(&self) -> Value {
            json!({})
        }

        fn from_data(_data: &Value) -> Self {
            Boom
        }
    }

    #[test]
    fn in_process_success_captures_stdout() {
        let mut job = Noisy;
        let output = run_in_process(&mut job, "test-noisy", "test-noisy.stderr");
        assert!(matches!(output.status, JobStatus::NoError));
        assert!(output.stdout.contains("hello from job"));
    }

    #[test]
    fn in_process_failure_is_errexcept() {
        let mut job = Boom;
        let output = run_in_process(&mut job, "test-boom", "test-boom.stderr");
        assert!(matches!(output.status, JobStatus::ErrExcept));
        assert_eq!(output.last_exception.as_deref(), Some("kaboom"));
    }
}
