// Socket destroy notifications
//
// Sockets closed without an explicit untag would leave their cookie row
// behind forever. The kernel multicasts a sock_diag message for every
// destroyed TCP/UDP socket; each one carries the cookie to drop.

use std::io;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use netlink_packet_core::{NLMSG_DONE, NetlinkBuffer};
use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_SOCK_DIAG};

use crate::controller::TrafficController;

const SKNLGRP_INET_TCP_DESTROY: u32 = 1;
const SKNLGRP_INET_UDP_DESTROY: u32 = 2;
const SKNLGRP_INET6_TCP_DESTROY: u32 = 3;
const SKNLGRP_INET6_UDP_DESTROY: u32 = 4;

const SOCK_DIAG_BY_FAMILY: u16 = 20;

/// `idiag_cookie` within `struct inet_diag_msg`
const IDIAG_COOKIE_OFFSET: usize = 44;

const POLL_TIMEOUT_MS: i32 = 1000;
const RECV_BUFFER_SIZE: usize = 8192;

fn group_mask(group: u32) -> u32 {
    1 << (group - 1)
}

/// Cookie of one `inet_diag_msg` payload
fn diag_cookie(payload: &[u8]) -> Option<u64> {
    let bytes = payload.get(IDIAG_COOKIE_OFFSET..IDIAG_COOKIE_OFFSET + 8)?;
    let low = u32::from_ne_bytes(bytes[..4].try_into().ok()?);
    let high = u32::from_ne_bytes(bytes[4..].try_into().ok()?);
    Some(low as u64 | (high as u64) << 32)
}

/// Cookies of every destroy message in one datagram
pub fn parse_messages(mut bytes: &[u8]) -> Vec<u64> {
    let mut cookies = Vec::new();

    while !bytes.is_empty() {
        let buf = match NetlinkBuffer::new_checked(bytes) {
            Ok(buf) => buf,
            Err(e) => {
                log::warn!("Dropping malformed sock_diag datagram: {:?}", e);
                break;
            }
        };

        match buf.message_type() {
            SOCK_DIAG_BY_FAMILY => match diag_cookie(buf.payload()) {
                Some(cookie) => cookies.push(cookie),
                None => log::warn!(
                    "sock_diag message too short: {} byte payload",
                    buf.payload().len()
                ),
            },
            NLMSG_DONE => {}
            other => log::debug!("Ignoring netlink message type {}", other),
        }

        let aligned = (buf.length() as usize + 3) & !3;
        if aligned == 0 || aligned >= bytes.len() {
            break;
        }
        bytes = &bytes[aligned..];
    }

    cookies
}

pub struct SkDestroyListener {
    socket: Socket,
    buffer: Vec<u8>,
}

impl SkDestroyListener {
    /// Subscribes to TCP and UDP destroy events for both address families
    pub fn new() -> io::Result<Self> {
        let mut socket = Socket::new(NETLINK_SOCK_DIAG)?;
        let groups = group_mask(SKNLGRP_INET_TCP_DESTROY)
            | group_mask(SKNLGRP_INET_UDP_DESTROY)
            | group_mask(SKNLGRP_INET6_TCP_DESTROY)
            | group_mask(SKNLGRP_INET6_UDP_DESTROY);
        socket.bind(&SocketAddr::new(0, groups))?;

        Ok(Self {
            socket,
            buffer: Vec::with_capacity(RECV_BUFFER_SIZE),
        })
    }

    /// Drops tags of destroyed sockets until `stop` is raised. Checks the
    /// flag at least once a second.
    pub fn run(mut self, controller: &TrafficController, stop: &AtomicBool) -> io::Result<()> {
        log::info!("Listening for socket destroy notifications");

        while !stop.load(Ordering::Relaxed) {
            if !self.wait_readable()? {
                continue;
            }

            self.buffer.clear();
            match self.socket.recv(&mut self.buffer, libc::MSG_DONTWAIT) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                    log::warn!("Socket destroy notifications overran, some tags may leak");
                    continue;
                }
                Err(e) => return Err(e),
            }

            for cookie in parse_messages(&self.buffer) {
                controller.on_socket_destroyed(cookie);
            }
        }

        log::info!("Socket destroy listener stopped");
        Ok(())
    }

    fn wait_readable(&self) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.socket.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, POLL_TIMEOUT_MS) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }
        Ok(ret > 0 && pfd.revents & libc::POLLIN != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NLMSG_HDRLEN: usize = 16;
    const INET_DIAG_MSG_LEN: usize = 72;

    fn message(msg_type: u16, payload: &[u8]) -> Vec<u8> {
        let len = (NLMSG_HDRLEN + payload.len()) as u32;
        let mut msg = Vec::new();
        msg.extend_from_slice(&len.to_ne_bytes());
        msg.extend_from_slice(&msg_type.to_ne_bytes());
        msg.extend_from_slice(&0u16.to_ne_bytes());
        msg.extend_from_slice(&0u32.to_ne_bytes());
        msg.extend_from_slice(&0u32.to_ne_bytes());
        msg.extend_from_slice(payload);
        while msg.len() % 4 != 0 {
            msg.push(0);
        }
        msg
    }

    fn destroy(cookie: u64) -> Vec<u8> {
        let mut diag = vec![0u8; INET_DIAG_MSG_LEN];
        diag[0] = libc::AF_INET6 as u8;
        diag[IDIAG_COOKIE_OFFSET..IDIAG_COOKIE_OFFSET + 4]
            .copy_from_slice(&(cookie as u32).to_ne_bytes());
        diag[IDIAG_COOKIE_OFFSET + 4..IDIAG_COOKIE_OFFSET + 8]
            .copy_from_slice(&((cookie >> 32) as u32).to_ne_bytes());
        message(SOCK_DIAG_BY_FAMILY, &diag)
    }

    #[test]
    fn test_group_mask_covers_all_four_groups() {
        let groups = group_mask(SKNLGRP_INET_TCP_DESTROY)
            | group_mask(SKNLGRP_INET_UDP_DESTROY)
            | group_mask(SKNLGRP_INET6_TCP_DESTROY)
            | group_mask(SKNLGRP_INET6_UDP_DESTROY);
        assert_eq!(groups, 0xF);
    }

    #[test]
    fn test_single_destroy_message() {
        assert_eq!(parse_messages(&destroy(0x1122_3344_5566_7788)), vec![0x1122_3344_5566_7788]);
    }

    #[test]
    fn test_several_messages_in_one_datagram() {
        let mut datagram = destroy(1);
        datagram.extend(destroy(2 << 32));
        datagram.extend(message(NLMSG_DONE, &[0; 4]));
        datagram.extend(destroy(3));

        assert_eq!(parse_messages(&datagram), vec![1, 2 << 32, 3]);
    }

    #[test]
    fn test_short_payload_is_skipped() {
        let mut datagram = message(SOCK_DIAG_BY_FAMILY, &[0u8; 20]);
        datagram.extend(destroy(9));

        assert_eq!(parse_messages(&datagram), vec![9]);
    }

    #[test]
    fn test_truncated_datagram_stops_parsing() {
        let mut datagram = destroy(5);
        let second = destroy(6);
        datagram.extend_from_slice(&second[..20]);

        assert_eq!(parse_messages(&datagram), vec![5]);
        assert!(parse_messages(&[]).is_empty());
    }
}
