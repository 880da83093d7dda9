//! Readiness notifications for a service supervisor.
//!
//! Speaks the `NOTIFY_SOCKET` datagram convention. Nothing here is fatal:
//! outside a supervisor the calls are no-ops and send failures are logged.

use std::ffi::OsStr;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixDatagram;
use tracing::{debug, warn};

pub const READY: &str = "READY=1";
pub const STOPPING: &str = "STOPPING=1";

const NOTIFY_SOCKET_ENV: &str = "NOTIFY_SOCKET";

pub fn notify_ready() {
    notify(READY);
}

pub fn notify_stopping() {
    notify(STOPPING);
}

fn notify(state: &str) {
    let Some(socket) = std::env::var_os(NOTIFY_SOCKET_ENV) else {
        return;
    };
    match send_to(&socket, state) {
        Ok(()) => debug!(state, "supervisor notified"),
        Err(err) => warn!(state, error = %err, "supervisor notification failed"),
    }
}

/// Sends one notification datagram. A leading `@` names a Linux abstract
/// socket.
pub fn send_to(socket: &OsStr, state: &str) -> io::Result<()> {
    let sock = UnixDatagram::unbound()?;
    let raw = socket.as_bytes();

    if let Some(name) = raw.strip_prefix(b"@") {
        #[cfg(target_os = "linux")]
        {
            use std::os::linux::net::SocketAddrExt;
            let addr = std::os::unix::net::SocketAddr::from_abstract_name(name)?;
            sock.send_to_addr(state.as_bytes(), &addr)?;
            return Ok(());
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = name;
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "abstract notify sockets are linux-only",
            ));
        }
    }

    sock.send_to(state.as_bytes(), socket)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagram_carries_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let receiver = UnixDatagram::bind(&path).unwrap();

        send_to(path.as_os_str(), READY).unwrap();

        let mut buf = [0u8; 64];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"READY=1");
    }

    #[test]
    fn missing_socket_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.sock");
        assert!(send_to(path.as_os_str(), STOPPING).is_err());
    }
}
