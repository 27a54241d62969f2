// Copyright (C) 2025 The Weald Authors. This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! The `exec` facility: launch an external program with its standard streams
//! piped back to the server, suspend the invoking task, and resume it with
//! `{exit_code, stdout, stderr}` once the child is reaped.
//!
//! Each in-flight child is a waiter keyed by its process id, owning the three
//! pipe descriptors and the suspended task's resume channel. Dropping a
//! waiter closes all three descriptors, on every path out of the table.

use std::ffi::{CString, c_char};
use std::fs;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::ptr;

use ahash::AHashMap;
use tracing::{error, info};

use weald_var::{Error, List, Var, v_int, v_list, v_str};

/// At most this many bytes are captured from each of the child's stdout and
/// stderr, in a single read. Callers rely on the truncation bound.
const OUTPUT_CAP: usize = 1000;

pub struct ExecConfig {
    /// Commands resolve under this directory; nothing outside it can be run.
    pub bin_subdir: PathBuf,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            bin_subdir: PathBuf::from("executables"),
        }
    }
}

/// Failures raised back to the invoking task. `code()` gives the MOO error
/// the raise carries; the `Display` text is its message.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("Invalid argument")]
    InvalidArgument,
    #[error("Incorrect number of arguments")]
    NoCommand,
    #[error("Invalid path")]
    InvalidPath,
    #[error("Does not exist")]
    DoesNotExist,
    #[error("Exec failed")]
    Failed(#[source] io::Error),
}

impl ExecError {
    pub fn code(&self) -> Error {
        match self {
            ExecError::InvalidArgument | ExecError::InvalidPath | ExecError::DoesNotExist => {
                Error::E_INVARG
            }
            ExecError::NoCommand => Error::E_ARGS,
            ExecError::Failed(_) => Error::E_EXEC,
        }
    }
}

/// What the task enumerator's callback tells us to do with a waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumAction {
    Continue,
    Stop,
    Kill,
}

struct ExecWaiter {
    // Held only so the child's stdin stays open until the waiter goes away.
    #[allow(dead_code)]
    stdin: OwnedFd,
    stdout: OwnedFd,
    stderr: OwnedFd,
    resume: oneshot::Sender<Var>,
}

/// The table of tasks waiting on external children, keyed by child pid.
#[derive(Default)]
pub struct ExecWaiters {
    table: AHashMap<libc::pid_t, ExecWaiter>,
}

impl ExecWaiters {
    pub fn new() -> Self {
        Self {
            table: AHashMap::new(),
        }
    }

    pub fn contains(&self, pid: libc::pid_t) -> bool {
        self.table.contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// The `exec` builtin: validate the argument list, resolve and launch the
    /// command, register a waiter under the child's pid, and hand back the
    /// channel the suspended task blocks on.
    pub fn start(
        &mut self,
        config: &ExecConfig,
        args: &List,
    ) -> Result<oneshot::Receiver<Var>, ExecError> {
        let mut strs = Vec::with_capacity(args.len());
        for v in args.iter() {
            let Some(s) = v.as_str() else {
                return Err(ExecError::InvalidArgument);
            };
            strs.push(s);
        }
        if strs.is_empty() {
            return Err(ExecError::NoCommand);
        }

        let cmd = strs[0];
        if cmd.len() > 1 && cmd.starts_with("..") {
            return Err(ExecError::InvalidPath);
        }
        if cmd.contains("/.") {
            return Err(ExecError::InvalidPath);
        }

        let resolved = config.bin_subdir.join(cmd.strip_prefix('/').unwrap_or(cmd));
        if fs::metadata(&resolved).is_err() {
            return Err(ExecError::DoesNotExist);
        }

        // Everything the child touches after fork has to exist already;
        // only async-signal-safe calls are allowed on its side.
        let prog = CString::new(resolved.as_os_str().as_bytes())
            .map_err(|_| ExecError::InvalidPath)?;
        let mut argv = Vec::with_capacity(strs.len());
        argv.push(prog.clone());
        for s in &strs[1..] {
            argv.push(CString::new(*s).map_err(|_| ExecError::InvalidArgument)?);
        }
        let argv_ptrs: Vec<*const c_char> = argv
            .iter()
            .map(|a| a.as_ptr())
            .chain(std::iter::once(ptr::null()))
            .collect();
        let env = [c"PATH=/bin:/usr/bin"];
        let env_ptrs: Vec<*const c_char> = env
            .iter()
            .map(|e| e.as_ptr())
            .chain(std::iter::once(ptr::null()))
            .collect();

        let (stdin_read, stdin_write) = mk_pipe().map_err(|e| {
            error!("EXEC: Couldn't create pipe - stdin: {e}");
            ExecError::Failed(e)
        })?;
        let (stdout_read, stdout_write) = mk_pipe().map_err(|e| {
            error!("EXEC: Couldn't create pipe - stdout: {e}");
            ExecError::Failed(e)
        })?;
        let (stderr_read, stderr_write) = mk_pipe().map_err(|e| {
            error!("EXEC: Couldn't create pipe - stderr: {e}");
            ExecError::Failed(e)
        })?;

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            let e = io::Error::last_os_error();
            error!("EXEC: Couldn't fork: {e}");
            return Err(ExecError::Failed(e));
        }
        if pid == 0 {
            // Child.
            unsafe {
                if libc::dup2(stdin_read.as_raw_fd(), libc::STDIN_FILENO) < 0
                    || libc::dup2(stdout_write.as_raw_fd(), libc::STDOUT_FILENO) < 0
                    || libc::dup2(stderr_write.as_raw_fd(), libc::STDERR_FILENO) < 0
                {
                    libc::_exit(127);
                }
                libc::close(stdin_write.as_raw_fd());
                libc::close(stdout_read.as_raw_fd());
                libc::close(stderr_read.as_raw_fd());
                libc::execve(prog.as_ptr(), argv_ptrs.as_ptr(), env_ptrs.as_ptr());
                libc::_exit(127);
            }
        }

        // Parent: keep our ends, drop the child's.
        drop(stdin_read);
        drop(stdout_write);
        drop(stderr_write);

        let (tx, rx) = oneshot::channel();
        self.table.insert(
            pid,
            ExecWaiter {
                stdin: stdin_write,
                stdout: stdout_read,
                stderr: stderr_read,
                resume: tx,
            },
        );
        info!("EXEC: Executing {} ...", resolved.display());
        Ok(rx)
    }

    /// A reaped child with exit status `code`: capture its buffered output,
    /// resume the suspended task with `{code, stdout, stderr}`, and release
    /// the waiter. Returns false for pids we aren't waiting on.
    pub fn completed(&mut self, pid: libc::pid_t, code: i32) -> bool {
        let Some(waiter) = self.table.remove(&pid) else {
            return false;
        };
        let stdout = read_capped(&waiter.stdout);
        let stderr = read_capped(&waiter.stderr);
        let result = v_list(&[v_int(code as i64), v_str(&stdout), v_str(&stderr)]);
        let _ = waiter.resume.send(result);
        true
    }

    /// Walk the waiters for the scheduler's task enumeration. A `Kill` drops
    /// the named waiter without resuming its task; the orphaned child is
    /// reaped whenever it exits.
    pub fn enumerate(
        &mut self,
        mut closure: impl FnMut(libc::pid_t, &str) -> EnumAction,
    ) -> EnumAction {
        let pids: Vec<libc::pid_t> = self.table.keys().copied().collect();
        for pid in pids {
            match closure(pid, "running") {
                EnumAction::Continue => {}
                EnumAction::Kill => {
                    self.table.remove(&pid);
                    return EnumAction::Kill;
                }
                EnumAction::Stop => return EnumAction::Stop,
            }
        }
        EnumAction::Continue
    }

    /// Pids of every in-flight child, for the scheduler's bookkeeping.
    pub fn pids(&self) -> Vec<libc::pid_t> {
        self.table.keys().copied().collect()
    }
}

fn mk_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// One read of at most [`OUTPUT_CAP`] bytes; anything further is dropped.
fn read_capped(fd: &OwnedFd) -> String {
    let mut buf = [0u8; OUTPUT_CAP];
    let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
    let n = if n < 0 { 0 } else { n as usize };
    String::from_utf8_lossy(&buf[..n]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use weald_var::v_obj;

    fn args(items: &[&str]) -> List {
        items.iter().map(|s| v_str(s)).collect::<Vec<_>>().into()
    }

    fn list_from(vars: Vec<Var>) -> List {
        vars.into()
    }

    #[test]
    fn test_argument_validation() {
        let mut waiters = ExecWaiters::new();
        let config = ExecConfig::default();
        assert!(matches!(
            waiters.start(&config, &args(&[])),
            Err(ExecError::NoCommand)
        ));
        let mixed = list_from(vec![v_str("ls"), v_obj(weald_var::NOTHING)]);
        assert!(matches!(
            waiters.start(&config, &mixed),
            Err(ExecError::InvalidArgument)
        ));
    }

    #[test]
    fn test_path_traversal_rejected() {
        let mut waiters = ExecWaiters::new();
        let config = ExecConfig::default();
        for cmd in ["../sh", "..", "bin/../sh", "bin/./sh", "x/.hidden"] {
            let e = waiters.start(&config, &args(&[cmd])).unwrap_err();
            assert!(matches!(e, ExecError::InvalidPath), "{cmd}: {e}");
        }
    }

    #[test]
    fn test_missing_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut waiters = ExecWaiters::new();
        let config = ExecConfig {
            bin_subdir: dir.path().to_path_buf(),
        };
        assert!(matches!(
            waiters.start(&config, &args(&["nonesuch"])),
            Err(ExecError::DoesNotExist)
        ));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ExecError::NoCommand.code(), Error::E_ARGS);
        assert_eq!(ExecError::InvalidPath.code(), Error::E_INVARG);
        assert_eq!(
            ExecError::Failed(io::Error::other("x")).code(),
            Error::E_EXEC
        );
        assert_eq!(ExecError::InvalidPath.to_string(), "Invalid path");
        assert_eq!(ExecError::DoesNotExist.to_string(), "Does not exist");
    }

    /// Build a waiter by hand around raw pipes, no child process involved.
    fn plant_waiter(waiters: &mut ExecWaiters, pid: libc::pid_t) -> (OwnedFd, OwnedFd, oneshot::Receiver<Var>) {
        let (stdin_read, stdin_write) = mk_pipe().unwrap();
        let (stdout_read, stdout_write) = mk_pipe().unwrap();
        let (stderr_read, stderr_write) = mk_pipe().unwrap();
        drop(stdin_read);
        let (tx, rx) = oneshot::channel();
        waiters.table.insert(
            pid,
            ExecWaiter {
                stdin: stdin_write,
                stdout: stdout_read,
                stderr: stderr_read,
                resume: tx,
            },
        );
        (stdout_write, stderr_write, rx)
    }

    fn write_all_fd(fd: OwnedFd, bytes: &[u8]) {
        let mut f = std::fs::File::from(fd);
        f.write_all(bytes).unwrap();
    }

    #[test]
    fn test_completed_resumes_with_captured_output() {
        let mut waiters = ExecWaiters::new();
        let (out_w, err_w, rx) = plant_waiter(&mut waiters, 4242);
        write_all_fd(out_w, b"hello out");
        write_all_fd(err_w, b"hello err");

        assert!(waiters.completed(4242, 3));
        assert!(waiters.is_empty());

        let result = rx.recv().unwrap();
        let l = result.as_list().unwrap();
        assert_eq!(l.len(), 3);
        assert_eq!(l.get(0).unwrap(), &v_int(3));
        assert_eq!(l.get(1).unwrap(), &v_str("hello out"));
        assert_eq!(l.get(2).unwrap(), &v_str("hello err"));
    }

    #[test]
    fn test_output_capped_at_single_read() {
        let mut waiters = ExecWaiters::new();
        let (out_w, err_w, rx) = plant_waiter(&mut waiters, 4243);
        write_all_fd(out_w, &vec![b'x'; 1500]);
        drop(err_w);

        assert!(waiters.completed(4243, 0));
        let result = rx.recv().unwrap();
        let l = result.as_list().unwrap();
        assert_eq!(l.get(1).unwrap().as_str().unwrap().len(), 1000);
        assert_eq!(l.get(2).unwrap(), &v_str(""));
    }

    #[test]
    fn test_completed_unknown_pid() {
        let mut waiters = ExecWaiters::new();
        assert!(!waiters.completed(999, 0));
    }

    #[test]
    fn test_kill_drops_waiter_without_resume() {
        let mut waiters = ExecWaiters::new();
        let (_out_w, _err_w, rx) = plant_waiter(&mut waiters, 4244);
        let action = waiters.enumerate(|pid, status| {
            assert_eq!(status, "running");
            if pid == 4244 {
                EnumAction::Kill
            } else {
                EnumAction::Continue
            }
        });
        assert_eq!(action, EnumAction::Kill);
        assert!(waiters.is_empty());
        // The suspended task's channel is gone, never resumed.
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_real_child_round_trip() {
        let mut waiters = ExecWaiters::new();
        let config = ExecConfig {
            bin_subdir: PathBuf::from("/bin"),
        };
        let rx = waiters
            .start(&config, &args(&["echo", "hello"]))
            .expect("echo should launch");
        let pid = waiters.pids()[0];

        let mut status = 0;
        let reaped = unsafe { libc::waitpid(pid, &mut status, 0) };
        assert_eq!(reaped, pid);
        let code = if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status)
        } else {
            -1
        };

        assert!(waiters.completed(pid, code));
        let result = rx.recv().unwrap();
        let l = result.as_list().unwrap();
        assert_eq!(l.get(0).unwrap(), &v_int(0));
        assert_eq!(l.get(1).unwrap(), &v_str("hello\n"));
        assert_eq!(l.get(2).unwrap(), &v_str(""));
    }

    #[test]
    fn test_leading_slash_resolves_under_bin_subdir() {
        let mut waiters = ExecWaiters::new();
        let dir = tempfile::tempdir().unwrap();
        let config = ExecConfig {
            bin_subdir: dir.path().to_path_buf(),
        };
        // "/tool" and "tool" resolve to the same (missing) path.
        assert!(matches!(
            waiters.start(&config, &args(&["/tool"])),
            Err(ExecError::DoesNotExist)
        ));
    }
}
