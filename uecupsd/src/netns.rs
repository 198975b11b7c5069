//! Network namespace entry/restore
//!
//! Named namespaces live under `/var/run/netns` (the `ip netns add`
//! convention). Entering a namespace is a thread-affine kernel state
//! change, so it is always scoped through [`NetnsGuard`]: acquire,
//! perform the operation (TUN open or child spawn, both without await
//! points inside the scope), restore on drop. Only the control task
//! switches namespaces.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use thiserror::Error;
use tracing::warn;

/// The runtime directory where named network namespaces are stored.
pub const NETNS_RUN_DIR: &str = "/var/run/netns";

/// Namespace handling errors
#[derive(Debug, Error)]
pub enum NetnsError {
    /// Named namespace file cannot be opened
    #[error("cannot open namespace '{name}': {source}")]
    Open {
        /// Namespace name
        name: String,
        /// Underlying error
        source: std::io::Error,
    },
    /// Current namespace handle cannot be obtained
    #[error("cannot open current namespace: {0}")]
    Current(std::io::Error),
    /// `setns(2)` failed
    #[error("setns failed: {0}")]
    Switch(std::io::Error),
}

/// A guard that restores the previous network namespace when dropped.
#[derive(Debug)]
pub struct NetnsGuard {
    original: File,
}

/// Enter a named network namespace.
///
/// The current thread switches to the namespace; the returned guard
/// switches back when dropped, on every exit path.
pub fn enter(name: &str) -> Result<NetnsGuard, NetnsError> {
    let original = File::open("/proc/self/ns/net").map_err(NetnsError::Current)?;

    let path = PathBuf::from(NETNS_RUN_DIR).join(name);
    let target = File::open(&path).map_err(|e| NetnsError::Open {
        name: name.to_string(),
        source: e,
    })?;

    // SAFETY: setns(2) with a valid namespace-file fd and CLONE_NEWNET
    // switches only this thread's network namespace.
    let ret = unsafe { libc::setns(target.as_raw_fd(), libc::CLONE_NEWNET) };
    if ret < 0 {
        return Err(NetnsError::Switch(std::io::Error::last_os_error()));
    }

    Ok(NetnsGuard { original })
}

impl NetnsGuard {
    fn do_restore(&self) -> Result<(), NetnsError> {
        // SAFETY: the fd was opened from /proc/self/ns/net when the
        // guard was created and stays valid for its lifetime.
        let ret = unsafe { libc::setns(self.original.as_raw_fd(), libc::CLONE_NEWNET) };
        if ret < 0 {
            return Err(NetnsError::Switch(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(e) = self.do_restore() {
            warn!(error = %e, "failed to restore network namespace");
        }
    }
}

/// Check whether a named namespace exists.
pub fn exists(name: &str) -> bool {
    PathBuf::from(NETNS_RUN_DIR).join(name).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_netns_run_dir() {
        assert_eq!(NETNS_RUN_DIR, "/var/run/netns");
    }

    #[test]
    fn test_exists_nonexistent() {
        assert!(!exists("definitely_does_not_exist_12345"));
    }

    #[test]
    fn test_enter_unknown_namespace_fails() {
        let err = enter("definitely_does_not_exist_12345").unwrap_err();
        assert!(matches!(err, NetnsError::Open { .. }));
    }
}
