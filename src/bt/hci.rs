//! Raw HCI event sockets.
//!
//! The kernel reports link-level events (number-of-completed-packets, max
//! slots change) only on the HCI channel, which bluer does not expose. We
//! open a raw `AF_BLUETOOTH`/`BTPROTO_HCI` socket with an event filter and
//! read it through an `AsyncFd`.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use tokio::io::unix::AsyncFd;

const BTPROTO_HCI: libc::c_int = 1;
const SOL_HCI: libc::c_int = 0;
const HCI_FILTER: libc::c_int = 2;
/// Packet-type bit for HCI events.
const HCI_EVENT_PKT: u32 = 0x04;

/// Number Of Completed Packets.
pub const EVT_NUM_COMP_PKTS: u32 = 0x13;
/// Max Slots Change.
pub const EVT_MAX_SLOTS_CHANGE: u32 = 0x1B;

#[repr(C)]
struct SockaddrHci {
    hci_family: libc::sa_family_t,
    hci_dev: u16,
    hci_channel: u16,
}

/// Kernel `struct hci_filter`.
#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

/// Non-blocking raw HCI socket filtered to a single event code.
pub struct HciEventSocket {
    fd: AsyncFd<OwnedFd>,
}

impl HciEventSocket {
    pub fn open(dev_id: u16, event: u32) -> io::Result<Self> {
        let raw = unsafe {
            libc::socket(
                libc::AF_BLUETOOTH,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                BTPROTO_HCI,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let filter = HciFilter {
            type_mask: 1 << HCI_EVENT_PKT,
            event_mask: [1u32.checked_shl(event).unwrap_or(0), 0],
            opcode: 0,
        };
        let rc = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                SOL_HCI,
                HCI_FILTER,
                &filter as *const HciFilter as *const libc::c_void,
                std::mem::size_of::<HciFilter>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        let addr = SockaddrHci {
            hci_family: libc::AF_BLUETOOTH as libc::sa_family_t,
            hci_dev: dev_id,
            hci_channel: 0,
        };
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const SockaddrHci as *const libc::sockaddr,
                std::mem::size_of::<SockaddrHci>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { fd: AsyncFd::new(fd)? })
    }

    /// Receives one event packet (packet type, event code, length, payload).
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                let n = unsafe {
                    libc::read(
                        inner.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}
