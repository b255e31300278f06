//! Host-side engine for the Surface Hub (SSH) serial protocol: a framed
//! request/response RPC surface plus an asynchronous event surface, carried
//! over a single duplex UART link to an embedded controller.
//!
//! The pieces, wired together as `transport -> assembler -> frame::decode ->
//! {request engine, event dispatcher}`:
//!
//! - [`frame`]: wire encode/decode and CRC16 framing.
//! - [`assembler`]: turns a byte stream into a sequence of decoded frames.
//! - [`request`]: the retry-driven request/response state machine.
//! - [`events`]: event ACK/dispatch queues and the handler registry.
//! - [`controller`]: lifecycle, locking, and the public client API.
//! - [`transport`]: the `Transport` collaborator and a `serialport`-backed
//!   implementation.
//!
//! ```no_run
//! use ssh_ec_proto::{Request, controller::SshController};
//! use ssh_ec_proto::transport::SerialTransport;
//! use std::sync::Arc;
//!
//! let transport = Arc::new(SerialTransport::new("/dev/ttyS0"));
//! let ctrl = SshController::new(transport);
//! ctrl.probe().expect("probe failed");
//!
//! let req = Request { tc: 0x01, iid: 0, cid: 0x16, has_response: false, payload: Vec::new() };
//! ctrl.rqst(&req, None).expect("request failed");
//! ```

pub mod assembler;
pub mod controller;
pub mod crc;
pub mod error;
pub mod events;
pub mod frame;
pub mod request;
pub mod transport;

pub use error::{Error, Result};

/// Low bits of the `rqid` space that identify an event class rather than a
/// host-initiated request. `NUM_EVENT_TYPES = (1 << EVENT_BITS) - 1` handler
/// slots are addressable; see [`rqid_is_event`].
pub const EVENT_BITS: u32 = 5;

/// Number of addressable event handler slots, indexed `rqid - 1`.
pub const NUM_EVENT_TYPES: usize = (1 << EVENT_BITS) - 1;

/// Upper bound on a single request's payload length (the wire length byte
/// is a `u8`, and the control frame's own length field must also fit one).
pub const MAX_PAYLOAD: usize = 255 - 8;

/// Number of send attempts per `rqst` call before giving up with `IoFailed`.
pub const NUM_RETRY: u32 = 3;

/// Default write/read timeouts used throughout the request engine.
pub const WRITE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);
pub const READ_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);

/// A host-initiated request to the controller. Immutable for the duration
/// of a single `rqst` call; retries re-send the identical encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub tc: u8,
    pub iid: u8,
    pub cid: u8,
    /// "send and collect": whether the caller expects a response payload.
    pub has_response: bool,
    pub payload: Vec<u8>,
}

/// Caller-owned response sink for a request with `has_response = true`: a
/// fixed-capacity buffer the engine fills in and reports the written
/// length for. Mirrors the `{capacity, length, data}` buffer of the
/// original wire protocol without exposing raw pointers.
pub struct ResponseBuffer<'a> {
    data: &'a mut [u8],
    length: usize,
}

impl<'a> ResponseBuffer<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        ResponseBuffer { data, length: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.length]
    }

    pub(crate) fn fill(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.data.len() {
            return Err(Error::InvalidLength {
                needed: bytes.len(),
                capacity: self.data.len(),
            });
        }
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.length = bytes.len();
        Ok(())
    }
}

/// A notification pushed by the controller, recognized by its `rqid` lying
/// in the event range (see [`rqid_is_event`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub rqid: u16,
    pub tc: u8,
    pub iid: u8,
    pub cid: u8,
    pub payload: Vec<u8>,
}

/// Converts the host's monotone `rqid` counter into its on-wire encoding:
/// shifted left clear of the event-class bits.
pub fn rqid_to_wire(rqid: u16) -> u16 {
    rqid << EVENT_BITS
}

/// True iff `rqid` falls in the event range: nonzero, and all bits below
/// `EVENT_BITS` set. `rqid == mask` itself counts as an event.
pub fn rqid_is_event(rqid: u16) -> bool {
    let mask: u16 = (1 << EVENT_BITS) - 1;
    rqid != 0 && (rqid | mask) == mask
}
