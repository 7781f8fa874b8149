/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use core::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes};

use crate::Error;

// Wire tags. Stable: these are what peers across versions agree on.
const TAG_IP4: u8 = 1;
const TAG_IP6: u8 = 2;
const TAG_TCP4: u8 = 3;
const TAG_TCP6: u8 = 4;
const TAG_UDP4: u8 = 5;
const TAG_UDP6: u8 = 6;
const TAG_UNIX: u8 = 7;
const TAG_UNIX_GRAM: u8 = 8;
const TAG_UNIX_PACKET: u8 = 9;
const TAG_USER: u8 = 10;

/// A canonical network address with a compact binary representation.
///
/// The wire format is a single type tag followed by the raw IP bytes
/// (4 or 16), an optional big-endian port and an optional UTF-8
/// zone/name running to the end of the buffer. [`Addr::User`] defers
/// its payload entirely to the application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Addr {
    /// Bare IPv4 host address.
    Ip4(Ipv4Addr),
    /// Bare IPv6 host address with an optional scope zone.
    Ip6 {
        /// Host address.
        ip: Ipv6Addr,
        /// Scope zone, empty when unscoped.
        zone: String,
    },
    /// TCP endpoint over IPv4.
    Tcp4 {
        /// Host address.
        ip: Ipv4Addr,
        /// Port number.
        port: u16,
    },
    /// TCP endpoint over IPv6.
    Tcp6 {
        /// Host address.
        ip: Ipv6Addr,
        /// Port number.
        port: u16,
        /// Scope zone, empty when unscoped.
        zone: String,
    },
    /// UDP endpoint over IPv4.
    Udp4 {
        /// Host address.
        ip: Ipv4Addr,
        /// Port number.
        port: u16,
    },
    /// UDP endpoint over IPv6.
    Udp6 {
        /// Host address.
        ip: Ipv6Addr,
        /// Port number.
        port: u16,
        /// Scope zone, empty when unscoped.
        zone: String,
    },
    /// Stream-oriented Unix domain socket.
    Unix(
        /// Socket path.
        String,
    ),
    /// Datagram-oriented Unix domain socket.
    UnixGram(
        /// Socket path.
        String,
    ),
    /// Sequenced-packet Unix domain socket.
    UnixPacket(
        /// Socket path.
        String,
    ),
    /// Application-defined address; the payload is opaque to the
    /// protocol.
    User(
        /// Marshalled address bytes.
        Bytes,
    ),
}

impl Addr {
    /// Appends the binary representation to `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        match self {
            Addr::Ip4(ip) => {
                buf.put_u8(TAG_IP4);
                buf.put_slice(&ip.octets());
            }
            Addr::Ip6 { ip, zone } => {
                buf.put_u8(TAG_IP6);
                buf.put_slice(&ip.octets());
                buf.put_slice(zone.as_bytes());
            }
            Addr::Tcp4 { ip, port } => {
                buf.put_u8(TAG_TCP4);
                buf.put_slice(&ip.octets());
                buf.put_u16(*port);
            }
            Addr::Tcp6 { ip, port, zone } => {
                buf.put_u8(TAG_TCP6);
                buf.put_slice(&ip.octets());
                buf.put_u16(*port);
                buf.put_slice(zone.as_bytes());
            }
            Addr::Udp4 { ip, port } => {
                buf.put_u8(TAG_UDP4);
                buf.put_slice(&ip.octets());
                buf.put_u16(*port);
            }
            Addr::Udp6 { ip, port, zone } => {
                buf.put_u8(TAG_UDP6);
                buf.put_slice(&ip.octets());
                buf.put_u16(*port);
                buf.put_slice(zone.as_bytes());
            }
            Addr::Unix(path) => {
                buf.put_u8(TAG_UNIX);
                buf.put_slice(path.as_bytes());
            }
            Addr::UnixGram(path) => {
                buf.put_u8(TAG_UNIX_GRAM);
                buf.put_slice(path.as_bytes());
            }
            Addr::UnixPacket(path) => {
                buf.put_u8(TAG_UNIX_PACKET);
                buf.put_slice(path.as_bytes());
            }
            Addr::User(payload) => {
                buf.put_u8(TAG_USER);
                buf.put_slice(payload);
            }
        }
    }

    /// The binary representation as a fresh buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = bytes::BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Parses an address from its binary representation. The whole
    /// buffer belongs to the address: trailing bytes are the zone or
    /// name, not padding.
    pub fn decode(mut buf: &[u8]) -> Result<Self, Error> {
        if !buf.has_remaining() {
            return Err(Error::InvalidAddress);
        }

        let tag = buf.get_u8();
        match tag {
            TAG_IP4 => Ok(Addr::Ip4(take_ip4(&mut buf)?)),
            TAG_IP6 => Ok(Addr::Ip6 {
                ip: take_ip6(&mut buf)?,
                zone: take_string(buf)?,
            }),
            TAG_TCP4 => Ok(Addr::Tcp4 {
                ip: take_ip4(&mut buf)?,
                port: take_port(&mut buf)?,
            }),
            TAG_TCP6 => Ok(Addr::Tcp6 {
                ip: take_ip6(&mut buf)?,
                port: take_port(&mut buf)?,
                zone: take_string(buf)?,
            }),
            TAG_UDP4 => Ok(Addr::Udp4 {
                ip: take_ip4(&mut buf)?,
                port: take_port(&mut buf)?,
            }),
            TAG_UDP6 => Ok(Addr::Udp6 {
                ip: take_ip6(&mut buf)?,
                port: take_port(&mut buf)?,
                zone: take_string(buf)?,
            }),
            TAG_UNIX => Ok(Addr::Unix(take_string(buf)?)),
            TAG_UNIX_GRAM => Ok(Addr::UnixGram(take_string(buf)?)),
            TAG_UNIX_PACKET => Ok(Addr::UnixPacket(take_string(buf)?)),
            TAG_USER => Ok(Addr::User(Bytes::copy_from_slice(buf))),
            _ => Err(Error::InvalidAddress),
        }
    }
}

fn take_ip4(buf: &mut &[u8]) -> Result<Ipv4Addr, Error> {
    if buf.remaining() < 4 {
        return Err(Error::InvalidAddress);
    }
    let mut octets = [0u8; 4];
    buf.copy_to_slice(&mut octets);
    Ok(Ipv4Addr::from(octets))
}

fn take_ip6(buf: &mut &[u8]) -> Result<Ipv6Addr, Error> {
    if buf.remaining() < 16 {
        return Err(Error::InvalidAddress);
    }
    let mut octets = [0u8; 16];
    buf.copy_to_slice(&mut octets);
    Ok(Ipv6Addr::from(octets))
}

fn take_port(buf: &mut &[u8]) -> Result<u16, Error> {
    if buf.remaining() < 2 {
        return Err(Error::InvalidAddress);
    }
    Ok(buf.get_u16())
}

fn take_string(buf: &[u8]) -> Result<String, Error> {
    core::str::from_utf8(buf)
        .map(String::from)
        .map_err(|_| Error::InvalidAddress)
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::Ip4(ip) => write!(f, "{ip}"),
            Addr::Ip6 { ip, zone } if zone.is_empty() => write!(f, "{ip}"),
            Addr::Ip6 { ip, zone } => write!(f, "{ip}%{zone}"),
            Addr::Tcp4 { ip, port } | Addr::Udp4 { ip, port } => write!(f, "{ip}:{port}"),
            Addr::Tcp6 { ip, port, zone } | Addr::Udp6 { ip, port, zone } => {
                if zone.is_empty() {
                    write!(f, "[{ip}]:{port}")
                } else {
                    write!(f, "[{ip}%{zone}]:{port}")
                }
            }
            Addr::Unix(path) | Addr::UnixGram(path) | Addr::UnixPacket(path) => {
                write!(f, "{path}")
            }
            Addr::User(payload) => write!(f, "user:{} bytes", payload.len()),
        }
    }
}
