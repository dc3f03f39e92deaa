use std::io;

use crate::error::CaptureError;

const GUIDANCE: &str = "packet capture needs CAP_NET_RAW; run as root or grant it with \
                        `sudo setcap cap_net_raw,cap_ipc_lock+ep <binary>`";

/// Check up front that this process may open packet sockets, so the
/// failure names the missing privilege instead of surfacing as a socket error.
pub fn check_capture_access() -> Result<(), CaptureError> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }
    match probe_packet_socket() {
        Ok(()) => Ok(()),
        Err(e) => Err(classify(e)),
    }
}

fn probe_packet_socket() -> io::Result<()> {
    let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe { libc::close(fd) };
    Ok(())
}

fn classify(err: io::Error) -> CaptureError {
    match err.raw_os_error() {
        Some(libc::EPERM) | Some(libc::EACCES) => {
            CaptureError::InsufficientPermission(GUIDANCE.to_string())
        }
        _ => CaptureError::Socket(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_errors_carry_guidance() {
        let err = classify(io::Error::from_raw_os_error(libc::EPERM));
        match err {
            CaptureError::InsufficientPermission(msg) => assert!(msg.contains("CAP_NET_RAW")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            classify(io::Error::from_raw_os_error(libc::EACCES)),
            CaptureError::InsufficientPermission(_)
        ));
    }

    #[test]
    fn other_errors_are_socket_errors() {
        assert!(matches!(
            classify(io::Error::from_raw_os_error(libc::EAFNOSUPPORT)),
            CaptureError::Socket(_)
        ));
    }

    #[test]
    fn root_always_passes() {
        if unsafe { libc::geteuid() } != 0 {
            return;
        }
        assert!(check_capture_access().is_ok());
    }
}
