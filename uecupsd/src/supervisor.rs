//! Child-process supervisor
//!
//! Tracks helper programs started on behalf of control clients. Each
//! child is awaited by its own task which reports the exit as an
//! in-band [`ChildExit`] message on the control task's channel, so
//! termination handling is serialised with all other control work and
//! the data-plane workers never see signals.
//!
//! The subprocess table is owned by the control task; no lock.

use std::collections::HashMap;
use std::ffi::CString;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use uecups_proto::StartProgram;

use crate::netns::{self, NetnsError};

/// Environment variable names a child inherits from the daemon; all
/// other daemon variables are stripped.
const ENV_WHITELIST: &[&str] = &[
    "PATH", "HOME", "USER", "LOGNAME", "SHELL", "TERM", "LANG", "LC_ALL", "PWD",
];

/// Capacity of the child-exit channel.
const EXIT_CHANNEL_CAPACITY: usize = 64;

/// Supervisor errors
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// `run_as_user` does not name a known user
    #[error("unknown user '{0}'")]
    UnknownUser(String),
    /// Namespace entry failed
    #[error(transparent)]
    Netns(#[from] NetnsError),
    /// fork/exec failed
    #[error("failed to spawn program: {0}")]
    Spawn(#[from] std::io::Error),
}

/// One reaped child, delivered in-band to the control task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    /// Pid of the terminated child
    pub pid: u32,
    /// Exit status; `128 + signo` for signalled children
    pub exit_code: i32,
}

struct SubprocessEntry {
    client_id: u64,
}

/// The subprocess table plus the spawn path.
pub struct Supervisor {
    children: HashMap<u32, SubprocessEntry>,
    exit_tx: mpsc::Sender<ChildExit>,
}

impl Supervisor {
    /// Create the supervisor and the exit-event receiver consumed by
    /// the control task.
    pub fn new() -> (Self, mpsc::Receiver<ChildExit>) {
        let (exit_tx, exit_rx) = mpsc::channel(EXIT_CHANNEL_CAPACITY);
        (
            Self {
                children: HashMap::new(),
                exit_tx,
            },
            exit_rx,
        )
    }

    /// Start a program on behalf of `client_id`.
    ///
    /// The command runs via `/bin/sh -c` with the whitelisted daemon
    /// environment plus the request's `K=V` entries, privileges dropped
    /// to `run_as_user` (gid before uid) and, when a namespace is
    /// given, forked inside it. The namespace guard is restored on
    /// every path; there is no await point inside the scope.
    pub fn start_program(
        &mut self,
        client_id: u64,
        prog: &StartProgram,
    ) -> Result<u32, SupervisorError> {
        let (uid, gid) = lookup_user(&prog.run_as_user)
            .ok_or_else(|| SupervisorError::UnknownUser(prog.run_as_user.clone()))?;

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(&prog.command);

        cmd.env_clear();
        for key in ENV_WHITELIST {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        if let Some(env) = &prog.environment {
            for entry in env {
                if let Some((key, value)) = entry.split_once('=') {
                    cmd.env(key, value);
                } else {
                    warn!(entry = %entry, "ignoring malformed environment entry");
                }
            }
        }

        // SAFETY: the pre-exec hook runs in the forked child before
        // exec and only calls async-signal-safe libc functions.
        unsafe {
            cmd.pre_exec(move || {
                if libc::setgid(gid) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::setuid(uid) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let ns_guard = match prog.tun_netns_name.as_deref() {
            Some(ns) => Some(netns::enter(ns)?),
            None => None,
        };
        let spawned = cmd.spawn();
        drop(ns_guard);
        let mut child = spawned?;

        let pid = child.id().unwrap_or_default();
        let exit_tx = self.exit_tx.clone();
        tokio::spawn(async move {
            let exit_code = match child.wait().await {
                Ok(status) => exit_code_of(status),
                Err(_) => -1,
            };
            let _ = exit_tx.send(ChildExit { pid, exit_code }).await;
        });

        self.children.insert(pid, SubprocessEntry { client_id });
        info!(pid, command = %prog.command, user = %prog.run_as_user, "started program");
        Ok(pid)
    }

    /// Account a reaped child. Returns the owning client when the pid
    /// was known; an unknown pid (already killed and forgotten) is the
    /// caller's cue to log and discard.
    pub fn handle_exit(&mut self, exit: &ChildExit) -> Option<u64> {
        self.children.remove(&exit.pid).map(|entry| entry.client_id)
    }

    /// SIGKILL and forget every subprocess owned by `client_id`.
    pub fn kill_for_client(&mut self, client_id: u64) -> usize {
        let pids: Vec<u32> = self
            .children
            .iter()
            .filter(|(_, entry)| entry.client_id == client_id)
            .map(|(&pid, _)| pid)
            .collect();
        for pid in &pids {
            kill_subprocess(*pid);
            self.children.remove(pid);
        }
        pids.len()
    }

    /// SIGKILL and forget every known subprocess.
    pub fn kill_all(&mut self) -> usize {
        let count = self.children.len();
        for (&pid, _) in self.children.iter() {
            kill_subprocess(pid);
        }
        self.children.clear();
        count
    }

    /// Number of tracked subprocesses.
    pub fn child_count(&self) -> usize {
        self.children.len()
    }
}

fn kill_subprocess(pid: u32) {
    debug!(pid, "sending SIGKILL to subprocess");
    // SAFETY: plain kill(2) on a pid we spawned and still track.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or_default())
}

fn lookup_user(name: &str) -> Option<(libc::uid_t, libc::gid_t)> {
    let cname = CString::new(name).ok()?;
    // SAFETY: getpwnam returns NULL or a pointer into static storage
    // that is read immediately on this thread.
    let pw = unsafe { libc::getpwnam(cname.as_ptr()) };
    if pw.is_null() {
        return None;
    }
    let pw = unsafe { &*pw };
    Some((pw.pw_uid, pw.pw_gid))
}

/// Name of the user the daemon runs as, for tests that must spawn
/// without privileges.
#[cfg(test)]
fn current_username() -> Option<String> {
    // SAFETY: getpwuid returns NULL or a pointer into static storage.
    let pw = unsafe { libc::getpwuid(libc::getuid()) };
    if pw.is_null() {
        return None;
    }
    let name = unsafe { std::ffi::CStr::from_ptr((*pw).pw_name) };
    Some(name.to_string_lossy().into_owned())
}
