// src/transport.rs
// Open the file descriptor a serialqueue runs on.

use std::fs::File;
use std::io;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};
use std::path::Path;
use std::time::Duration;

use log::info;

use crate::serialqueue::TransportKind;

/// Open `path` for the given transport.
///
/// For uart `path` is a tty and `baud` its rate; for can it is a
/// network interface name (eg "can0"); for a debug file it is created or
/// truncated.
pub fn open(path: &str, kind: TransportKind, baud: u32) -> io::Result<OwnedFd> {
    match kind {
        TransportKind::Uart => open_uart(path, baud),
        TransportKind::Can { client_id } => open_can(path, client_id),
        TransportKind::DebugFile => Ok(OwnedFd::from(File::create(Path::new(path))?)),
    }
}

fn open_uart(path: &str, baud: u32) -> io::Result<OwnedFd> {
    let port = ::serialport::new(path, baud)
        .data_bits(::serialport::DataBits::Eight)
        .parity(::serialport::Parity::None)
        .stop_bits(::serialport::StopBits::One)
        .flow_control(::serialport::FlowControl::None)
        .timeout(Duration::ZERO)
        .open_native()
        .map_err(io::Error::from)?;
    info!("Opened serial port: {} at {} baud", path, baud);
    // SAFETY: into_raw_fd hands over sole ownership of a valid descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(port.into_raw_fd()) })
}

#[cfg(target_os = "linux")]
fn open_can(ifname: &str, client_id: u32) -> io::Result<OwnedFd> {
    use std::ffi::CString;
    use std::mem;

    let cname = CString::new(ifname).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: plain libc calls; every return code is checked and the
    // descriptor is wrapped in an OwnedFd right after creation.
    unsafe {
        let ifindex = libc::if_nametoindex(cname.as_ptr());
        if ifindex == 0 {
            return Err(io::Error::last_os_error());
        }
        let raw = libc::socket(libc::PF_CAN, libc::SOCK_RAW, libc::CAN_RAW);
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = OwnedFd::from_raw_fd(raw);

        // Only receive frames from the mcu's reply id
        let filter = libc::can_filter {
            can_id: client_id + 1,
            can_mask: libc::CAN_EFF_FLAG | libc::CAN_RTR_FLAG | libc::CAN_SFF_MASK,
        };
        let ret = libc::setsockopt(
            raw,
            libc::SOL_CAN_RAW,
            libc::CAN_RAW_FILTER,
            &filter as *const libc::can_filter as *const libc::c_void,
            mem::size_of::<libc::can_filter>() as libc::socklen_t,
        );
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut addr: libc::sockaddr_can = mem::zeroed();
        addr.can_family = libc::AF_CAN as libc::sa_family_t;
        addr.can_ifindex = ifindex as libc::c_int;
        let ret = libc::bind(
            raw,
            &addr as *const libc::sockaddr_can as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_can>() as libc::socklen_t,
        );
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        info!("Opened can interface {} for client id {:#x}", ifname, client_id);
        Ok(fd)
    }
}

#[cfg(not(target_os = "linux"))]
fn open_can(_ifname: &str, _client_id: u32) -> io::Result<OwnedFd> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "can transport requires linux"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn debug_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let fd = open(path.to_str().unwrap(), TransportKind::DebugFile, 0).unwrap();
        drop(fd);
        let mut content = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut content).unwrap();
        assert!(content.is_empty());
    }

    #[test]
    fn missing_tty_is_an_error() {
        assert!(open("/nonexistent/tty", TransportKind::Uart, 250_000).is_err());
    }
}
