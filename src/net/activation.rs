//! Socket activation: listeners passed in by a service manager.
//!
//! # Convention
//! ```text
//! LISTEN_FDS=N              number of descriptors passed
//! SD_LISTEN_FDS_START=S     first descriptor (default 3)
//! LISTEN_PID=P              process the descriptors are meant for (optional)
//!
//! descriptors S, S+1, ..., S+N-1 are listening sockets
//! ```
//!
//! # Design Decisions
//! - Missing or malformed variables are errors, not an empty listener set
//! - Every descriptor is checked to be a stream socket before it is adopted
//! - The address family decides whether it is served as TCP or Unix
//! - Variables read from the process are removed once consumed, so child
//!   processes do not inherit a stale activation environment

use std::fs::File;
use std::ops::Range;
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::FileTypeExt;

use socket2::{Domain, Socket, Type};

use crate::error::ConfigError;
use crate::net::listener::{BoundListener, ListenerBinding};

pub const LISTEN_FDS: &str = "LISTEN_FDS";
pub const LISTEN_FDS_START: &str = "SD_LISTEN_FDS_START";
pub const LISTEN_PID: &str = "LISTEN_PID";

/// First passed descriptor when [`LISTEN_FDS_START`] is unset.
pub const DEFAULT_FDS_START: RawFd = 3;

/// Raw socket-activation variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationEnv {
    pub fds: Option<String>,
    pub fds_start: Option<String>,
    pub pid: Option<String>,
    /// Remove the variables from the process environment in [`listeners`](Self::listeners).
    pub unset_env: bool,
}

impl ActivationEnv {
    /// Read the variables from the process environment.
    pub fn from_process() -> Self {
        Self {
            fds: std::env::var(LISTEN_FDS).ok(),
            fds_start: std::env::var(LISTEN_FDS_START).ok(),
            pid: std::env::var(LISTEN_PID).ok(),
            unset_env: true,
        }
    }

    pub fn with_unset_env(mut self, unset: bool) -> Self {
        self.unset_env = unset;
        self
    }

    /// Descriptor range announced by the variables.
    pub fn descriptors(&self) -> Result<Range<RawFd>, ConfigError> {
        if let Some(pid) = &self.pid {
            let pid: u32 = pid
                .trim()
                .parse()
                .map_err(|_| ConfigError::Activation(format!("invalid {} {:?}", LISTEN_PID, pid)))?;
            if pid != std::process::id() {
                return Err(ConfigError::Activation(format!(
                    "descriptors were passed to pid {}, not to this process",
                    pid
                )));
            }
        }

        let raw = self
            .fds
            .as_deref()
            .ok_or_else(|| ConfigError::Activation(format!("{} is not set", LISTEN_FDS)))?;
        let count: RawFd = raw
            .trim()
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| ConfigError::Activation(format!("invalid {} {:?}", LISTEN_FDS, raw)))?;

        let start = match self.fds_start.as_deref() {
            None => DEFAULT_FDS_START,
            Some(raw) => raw
                .trim()
                .parse()
                .ok()
                .filter(|n: &RawFd| *n >= 0)
                .ok_or_else(|| ConfigError::Activation(format!("invalid {} {:?}", LISTEN_FDS_START, raw)))?,
        };

        let end = start
            .checked_add(count)
            .ok_or_else(|| ConfigError::Activation(format!("descriptor range {}+{} overflows", start, count)))?;
        Ok(start..end)
    }

    /// Validate and adopt every announced descriptor.
    ///
    /// The environment is cleared first when `unset_env` is set, whether or
    /// not adoption succeeds.
    pub fn listeners(&self) -> Result<Vec<BoundListener>, ConfigError> {
        if self.unset_env {
            for var in [LISTEN_FDS, LISTEN_FDS_START, LISTEN_PID] {
                std::env::remove_var(var);
            }
        }
        let range = self.descriptors()?;
        tracing::debug!(first = range.start, count = range.len(), "Adopting activated sockets");
        range.map(adopt).collect()
    }
}

/// Check that `fd` is a stream socket, then take ownership of it.
fn adopt(fd: RawFd) -> Result<BoundListener, ConfigError> {
    let probe = probe(fd)?;
    if probe.r#type().ok() != Some(Type::STREAM) {
        return Err(ConfigError::NotASocket { fd });
    }
    let local = probe
        .local_addr()
        .map_err(|e| ConfigError::Activation(format!("descriptor {}: {}", fd, e)))?;
    drop(probe);

    // SAFETY: the service manager passed this descriptor to us; it was just
    // verified to be an open socket and nothing else in the process owns it.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    let socket = Socket::from(owned);

    let listener = match local.domain() {
        Domain::IPV4 | Domain::IPV6 => {
            let addr = local.as_socket().map(|a| a.to_string()).unwrap_or_default();
            tracing::info!(fd, address = %addr, "Inherited TCP listener");
            BoundListener::tcp(socket.into(), ListenerBinding::Inherited { fd, local: addr })
        }
        Domain::UNIX => {
            let path = local
                .as_pathname()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "unnamed".to_string());
            tracing::info!(fd, path = %path, "Inherited Unix listener");
            BoundListener::unix(socket.into(), ListenerBinding::Inherited { fd, local: path })
        }
        _ => return Err(ConfigError::NotASocket { fd }),
    };
    Ok(listener)
}

/// Duplicate `fd` for inspection without taking ownership of the original.
fn probe(fd: RawFd) -> Result<Socket, ConfigError> {
    if fd < 0 {
        return Err(ConfigError::NotASocket { fd });
    }
    let io_err = |e: std::io::Error| ConfigError::Activation(format!("descriptor {}: {}", fd, e));

    // SAFETY: the borrow does not outlive this function and is only used to
    // duplicate the descriptor; an invalid descriptor surfaces as EBADF.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let file = File::from(borrowed.try_clone_to_owned().map_err(io_err)?);

    if !file.metadata().map_err(io_err)?.file_type().is_socket() {
        return Err(ConfigError::NotASocket { fd });
    }
    Ok(Socket::from(OwnedFd::from(file)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::{AsRawFd, IntoRawFd};

    fn env(fds: Option<&str>, start: Option<&str>) -> ActivationEnv {
        ActivationEnv {
            fds: fds.map(String::from),
            fds_start: start.map(String::from),
            pid: None,
            unset_env: false,
        }
    }

    #[test]
    fn missing_count_is_an_error() {
        let err = env(None, None).descriptors().unwrap_err();
        assert!(matches!(err, ConfigError::Activation(_)));
    }

    #[test]
    fn invalid_counts_are_errors() {
        for raw in ["", "abc", "0", "-2"] {
            let err = env(Some(raw), None).descriptors().unwrap_err();
            assert!(matches!(err, ConfigError::Activation(_)), "{:?}", raw);
        }
    }

    #[test]
    fn range_starts_at_three_by_default() {
        assert_eq!(env(Some("2"), None).descriptors().unwrap(), 3..5);
        assert_eq!(env(Some("1"), Some("10")).descriptors().unwrap(), 10..11);
    }

    #[test]
    fn foreign_pid_is_rejected() {
        let mut activation = env(Some("1"), None);
        activation.pid = Some((std::process::id() + 1).to_string());
        assert!(activation.descriptors().is_err());

        activation.pid = Some(std::process::id().to_string());
        assert_eq!(activation.descriptors().unwrap(), 3..4);
    }

    #[test]
    fn regular_file_is_not_a_socket() {
        let file = tempfile::tempfile().unwrap();
        let fd = file.as_raw_fd();

        let err = env(Some("1"), Some(&fd.to_string())).listeners().unwrap_err();
        assert!(matches!(err, ConfigError::NotASocket { fd: got } if got == fd));
        // The descriptor was only inspected, never taken over.
        assert!(file.metadata().is_ok());
    }

    #[test]
    fn listening_tcp_socket_is_adopted() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let fd = listener.into_raw_fd();

        let adopted = env(Some("1"), Some(&fd.to_string())).listeners().unwrap();
        assert_eq!(adopted.len(), 1);
        assert!(adopted[0].is_tcp());
        assert_eq!(
            adopted[0].binding(),
            &ListenerBinding::Inherited {
                fd,
                local: addr.to_string()
            }
        );
    }

    #[test]
    #[serial_test::serial]
    fn process_environment_is_cleared_after_adoption() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = listener.into_raw_fd();
        std::env::set_var(LISTEN_FDS, "1");
        std::env::set_var(LISTEN_FDS_START, fd.to_string());
        std::env::set_var(LISTEN_PID, std::process::id().to_string());

        let activation = ActivationEnv::from_process();
        assert!(activation.unset_env);
        assert_eq!(activation.listeners().unwrap().len(), 1);

        for var in [LISTEN_FDS, LISTEN_FDS_START, LISTEN_PID] {
            assert!(std::env::var(var).is_err(), "{var} still set");
        }
    }

    #[test]
    #[serial_test::serial]
    fn environment_is_kept_when_asked() {
        std::env::set_var(LISTEN_FDS, "not-a-number");

        let activation = ActivationEnv::from_process().with_unset_env(false);
        assert!(activation.listeners().is_err());
        assert_eq!(std::env::var(LISTEN_FDS).as_deref(), Ok("not-a-number"));

        std::env::remove_var(LISTEN_FDS);
    }
}
