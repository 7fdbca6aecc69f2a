use thiserror::Error;

/// Errors produced by silo lifecycle primitives.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("silo already running")]
    AlreadyRunning,
    #[error("silo not running")]
    NotRunning,
    #[error("silo not pending")]
    NotPending,

    #[error("address pool exhausted")]
    PoolExhausted,
    #[error("bad address pool {pool}: {reason}")]
    BadPool { pool: String, reason: String },

    #[error("cgroup subsystem {0} is not mounted")]
    SubsystemNotMounted(String),

    #[error("interface {0} already exists")]
    DeviceExists(String),
    #[error("interface {0} not found")]
    DeviceNotFound(String),
    #[error("interface {0} did not come up within the timeout")]
    InterfaceTimeout(String),
    #[error("netlink operation failed: {0}")]
    Netlink(#[from] rtnetlink::Error),
    #[error("iptables {action} failed: {detail}")]
    Iptables { action: String, detail: String },

    #[error("system call failed: {0}")]
    Sys(#[from] nix::errno::Errno),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invocation descriptor: {0}")]
    Descriptor(#[from] serde_json::Error),
    #[error("startup command {cmd:?} exited with status {status}")]
    StartupCommand { cmd: String, status: i32 },
}

impl ControllerError {
    /// Wrap an io error with the operation that produced it.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ControllerError::Io {
            context: context.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_are_stable() {
        assert_eq!(
            ControllerError::PoolExhausted.to_string(),
            "address pool exhausted"
        );
        assert_eq!(
            ControllerError::DeviceExists("b0-deadbeef".to_string()).to_string(),
            "interface b0-deadbeef already exists"
        );
    }

    #[test]
    fn test_io_wrapping_keeps_context() {
        let err = ControllerError::io(
            "write /proc/self/uid_map",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(err.to_string().starts_with("write /proc/self/uid_map"));
    }
}
