//! NAT-PMP wire format - RFC 6886
//!
//! Pure encode/decode of the fixed request and response layouts. No I/O and no
//! state lives here; every multi-byte integer is big-endian.
//!
//! ```text
//! request:  version(1) | opcode(1) [| reserved(2) | private(2) | public(2) | lifetime(4)]
//! response: version(1) | opcode+128(1) | result(2) | epoch(4) | body
//! ```

use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// NAT-PMP protocol version
pub const NATPMP_VERSION: u8 = 0;

/// Port the client binds to (and receives gateway announcements on)
pub const CLIENT_PORT: u16 = 5350;

/// Port the gateway listens on
pub const SERVER_PORT: u16 = 5351;

/// Bit ORed into the request opcode to form the response opcode
pub const RESPONSE_FLAG: u8 = 128;

/// version + opcode + result code + seconds since start
const HEADER_LEN: usize = 8;
const EXTERNAL_ADDRESS_REQUEST_LEN: usize = 2;
const MAP_REQUEST_LEN: usize = 12;
const EXTERNAL_ADDRESS_RESPONSE_LEN: usize = 12;
const MAP_RESPONSE_LEN: usize = 16;

/// Transport protocol of a port mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    /// UDP mapping (opcode 1)
    Udp,
    /// TCP mapping (opcode 2)
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => write!(f, "UDP"),
            Self::Tcp => write!(f, "TCP"),
        }
    }
}

/// NAT-PMP request opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// External address request
    ExternalAddress = 0,
    /// UDP port mapping
    MapUdp = 1,
    /// TCP port mapping
    MapTcp = 2,
}

impl Opcode {
    /// Convert from the request opcode byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::ExternalAddress),
            1 => Some(Self::MapUdp),
            2 => Some(Self::MapTcp),
            _ => None,
        }
    }

    /// Mapping opcode for a protocol
    pub fn for_protocol(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Udp => Self::MapUdp,
            Protocol::Tcp => Self::MapTcp,
        }
    }

    /// Protocol of a mapping opcode, `None` for [`Opcode::ExternalAddress`]
    pub fn protocol(&self) -> Option<Protocol> {
        match self {
            Self::ExternalAddress => None,
            Self::MapUdp => Some(Protocol::Udp),
            Self::MapTcp => Some(Protocol::Tcp),
        }
    }

    /// Opcode byte carried by the matching response
    pub fn response_byte(&self) -> u8 {
        *self as u8 | RESPONSE_FLAG
    }

    fn response_len(&self) -> usize {
        match self {
            Self::ExternalAddress => EXTERNAL_ADDRESS_RESPONSE_LEN,
            Self::MapUdp | Self::MapTcp => MAP_RESPONSE_LEN,
        }
    }
}

/// NAT-PMP result codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// Success
    Success,
    /// Unsupported version
    UnsupportedVersion,
    /// Not authorized/refused, e.g. mapping disabled by the user
    NotAuthorized,
    /// Network failure, e.g. the gateway has no DHCP lease yet
    NetworkFailure,
    /// Out of resources, the gateway cannot create more mappings
    OutOfResources,
    /// Unsupported opcode
    UnsupportedOpcode,
    /// Any code outside the range defined by RFC 6886
    Unknown(u16),
}

impl ResultCode {
    /// Convert from the numeric result code
    pub fn from_u16(code: u16) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::UnsupportedVersion,
            2 => Self::NotAuthorized,
            3 => Self::NetworkFailure,
            4 => Self::OutOfResources,
            5 => Self::UnsupportedOpcode,
            other => Self::Unknown(other),
        }
    }

    /// Numeric result code as carried on the wire
    pub fn as_u16(&self) -> u16 {
        match self {
            Self::Success => 0,
            Self::UnsupportedVersion => 1,
            Self::NotAuthorized => 2,
            Self::NetworkFailure => 3,
            Self::OutOfResources => 4,
            Self::UnsupportedOpcode => 5,
            Self::Unknown(code) => *code,
        }
    }

    /// Human-readable meaning of the code
    pub fn to_error_message(&self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::UnsupportedVersion => "Unsupported NAT-PMP version",
            Self::NotAuthorized => "Not authorized/refused",
            Self::NetworkFailure => "Network failure",
            Self::OutOfResources => "Out of resources",
            Self::UnsupportedOpcode => "Unsupported opcode",
            Self::Unknown(_) => "Unknown result code",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.to_error_message(), self.as_u16())
    }
}

/// A client request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Ask for the gateway's external IPv4 address
    ExternalAddress,
    /// Create, renew (lifetime > 0) or destroy (lifetime = 0) a mapping
    Map {
        /// TCP or UDP
        protocol: Protocol,
        /// Port on this host
        private_port: u16,
        /// Suggested external port, 0 lets the gateway choose
        public_port: u16,
        /// Requested lifetime in seconds
        lifetime_secs: u32,
    },
}

impl Request {
    /// Opcode of the request
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::ExternalAddress => Opcode::ExternalAddress,
            Self::Map { protocol, .. } => Opcode::for_protocol(*protocol),
        }
    }

    /// Encode into the wire layout (2 or 12 bytes)
    pub fn encode(&self) -> Bytes {
        match self {
            Self::ExternalAddress => {
                let mut buf = BytesMut::with_capacity(EXTERNAL_ADDRESS_REQUEST_LEN);
                buf.put_u8(NATPMP_VERSION);
                buf.put_u8(Opcode::ExternalAddress as u8);
                buf.freeze()
            }
            Self::Map {
                protocol,
                private_port,
                public_port,
                lifetime_secs,
            } => {
                let mut buf = BytesMut::with_capacity(MAP_REQUEST_LEN);
                buf.put_u8(NATPMP_VERSION);
                buf.put_u8(Opcode::for_protocol(*protocol) as u8);
                // Reserved, must be zero
                buf.put_u16(0);
                buf.put_u16(*private_port);
                buf.put_u16(*public_port);
                buf.put_u32(*lifetime_secs);
                buf.freeze()
            }
        }
    }

    /// Decode a request datagram
    pub fn decode(datagram: &[u8]) -> Result<Self> {
        if datagram.len() < EXTERNAL_ADDRESS_REQUEST_LEN {
            return Err(malformed(format!(
                "Request too short: {} bytes",
                datagram.len()
            )));
        }

        let mut buf = datagram;
        check_version(buf.get_u8())?;
        let opcode_byte = buf.get_u8();
        let opcode = Opcode::from_u8(opcode_byte)
            .ok_or_else(|| malformed(format!("Unknown request opcode: {}", opcode_byte)))?;

        match opcode.protocol() {
            None => {
                expect_len(datagram, EXTERNAL_ADDRESS_REQUEST_LEN)?;
                Ok(Self::ExternalAddress)
            }
            Some(protocol) => {
                expect_len(datagram, MAP_REQUEST_LEN)?;
                let _reserved = buf.get_u16();
                Ok(Self::Map {
                    protocol,
                    private_port: buf.get_u16(),
                    public_port: buf.get_u16(),
                    lifetime_secs: buf.get_u32(),
                })
            }
        }
    }
}

/// Operation-specific trailing fields of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseBody {
    /// External IPv4 address of the gateway
    ExternalAddress(Ipv4Addr),
    /// Outcome of a mapping request
    Map {
        /// Port on the requesting host
        private_port: u16,
        /// External port assigned by the gateway
        public_port: u16,
        /// Granted lifetime in seconds
        lifetime_secs: u32,
    },
}

/// A decoded gateway reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    /// Opcode of the request this answers (response flag stripped)
    pub opcode: Opcode,
    /// Gateway outcome
    pub result_code: ResultCode,
    /// Seconds since the gateway (re)started its mapping table
    pub epoch_secs: u32,
    /// Trailing fields; absent only for header-only error responses
    pub body: Option<ResponseBody>,
}

impl Response {
    /// Encode into the wire layout
    ///
    /// The client never sends responses; this exists for gateway simulations.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MAP_RESPONSE_LEN);
        buf.put_u8(NATPMP_VERSION);
        buf.put_u8(self.opcode.response_byte());
        buf.put_u16(self.result_code.as_u16());
        buf.put_u32(self.epoch_secs);

        match self.body {
            Some(ResponseBody::ExternalAddress(ip)) => buf.put_slice(&ip.octets()),
            Some(ResponseBody::Map {
                private_port,
                public_port,
                lifetime_secs,
            }) => {
                buf.put_u16(private_port);
                buf.put_u16(public_port);
                buf.put_u32(lifetime_secs);
            }
            None => {}
        }

        buf.freeze()
    }

    /// Decode a response datagram
    ///
    /// The length must match the opcode exactly. Error responses may also be
    /// header-only (8 bytes), in which case `body` is `None`.
    pub fn decode(datagram: &[u8]) -> Result<Self> {
        if datagram.len() < HEADER_LEN {
            return Err(malformed(format!(
                "Response too short: {} bytes (expected at least {})",
                datagram.len(),
                HEADER_LEN
            )));
        }

        let mut buf = datagram;
        check_version(buf.get_u8())?;

        let opcode_byte = buf.get_u8();
        if opcode_byte & RESPONSE_FLAG == 0 {
            return Err(malformed(
                "Received request instead of response".to_string(),
            ));
        }
        let opcode = Opcode::from_u8(opcode_byte & !RESPONSE_FLAG)
            .ok_or_else(|| malformed(format!("Unknown response opcode: {}", opcode_byte)))?;

        let result_code = ResultCode::from_u16(buf.get_u16());
        let epoch_secs = buf.get_u32();

        if datagram.len() == HEADER_LEN && result_code != ResultCode::Success {
            return Ok(Self {
                opcode,
                result_code,
                epoch_secs,
                body: None,
            });
        }
        expect_len(datagram, opcode.response_len())?;

        let body = match opcode {
            Opcode::ExternalAddress => {
                ResponseBody::ExternalAddress(Ipv4Addr::from(buf.get_u32()))
            }
            Opcode::MapUdp | Opcode::MapTcp => ResponseBody::Map {
                private_port: buf.get_u16(),
                public_port: buf.get_u16(),
                lifetime_secs: buf.get_u32(),
            },
        };

        Ok(Self {
            opcode,
            result_code,
            epoch_secs,
            body: Some(body),
        })
    }
}

fn malformed(msg: String) -> Error {
    Error::MalformedMessage(msg)
}

fn check_version(version: u8) -> Result<()> {
    if version != NATPMP_VERSION {
        return Err(malformed(format!(
            "Invalid version: {} (expected {})",
            version, NATPMP_VERSION
        )));
    }
    Ok(())
}

fn expect_len(datagram: &[u8], expected: usize) -> Result<()> {
    if datagram.len() != expected {
        return Err(malformed(format!(
            "Invalid length: {} bytes (expected {})",
            datagram.len(),
            expected
        )));
    }
    Ok(())
}
