//! Outbound request construction.
//!
//! A [`RequestBuilder`] is single-use: the first `build` consumes its body
//! buffers, a second `build` fails with [`WireError::IllegalReuse`]. The
//! opaque correlator is supplied at build time by the dispatcher.

use crate::WireError;
use crate::frame::{HEADER_SIZE, Magic, opcode};
use crate::types::StreamOffset;
use bytes::{BufMut, Bytes, BytesMut};

/// Producer flag in the DCP_OPEN extras.
const OPEN_FLAG_PRODUCER: u32 = 0x01;

/// Builds one request frame.
pub struct RequestBuilder {
    opcode: u8,
    vbucket: u16,
    cas: u64,
    extras: Vec<u8>,
    key: Vec<u8>,
    value: Vec<u8>,
    built: bool,
}

impl RequestBuilder {
    pub fn new(opcode: u8) -> RequestBuilder {
        RequestBuilder {
            opcode,
            vbucket: 0,
            cas: 0,
            extras: Vec::new(),
            key: Vec::new(),
            value: Vec::new(),
            built: false,
        }
    }

    pub fn vbucket(mut self, vbucket: u16) -> Self {
        self.vbucket = vbucket;
        self
    }

    pub fn cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn extras(mut self, extras: Vec<u8>) -> Self {
        self.extras = extras;
        self
    }

    pub fn key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = key.into();
        self
    }

    pub fn value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = value.into();
        self
    }

    /// Encode the frame with the given opaque. At most one build per builder.
    pub fn build(&mut self, opaque: u32) -> Result<Bytes, WireError> {
        if self.built {
            return Err(WireError::IllegalReuse);
        }
        self.built = true;

        let body_len = self.extras.len() + self.key.len() + self.value.len();
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + body_len);
        buf.put_u8(Magic::REQUEST);
        buf.put_u8(self.opcode);
        buf.put_u16(self.key.len() as u16);
        buf.put_u8(self.extras.len() as u8);
        buf.put_u8(0); // data type
        buf.put_u16(self.vbucket);
        buf.put_u32(body_len as u32);
        buf.put_u32(opaque);
        buf.put_u64(self.cas);
        buf.put_slice(&self.extras);
        buf.put_slice(&self.key);
        buf.put_slice(&self.value);
        Ok(buf.freeze())
    }

    // -----------------------------------------------------------------------
    // Canned requests
    // -----------------------------------------------------------------------

    /// Stream request: resume partition `vbucket` from `offset` up to
    /// `end_seqno`.
    pub fn stream_request(vbucket: u16, offset: StreamOffset, end_seqno: u64) -> RequestBuilder {
        let mut extras = Vec::with_capacity(48);
        extras.put_u32(0); // flags
        extras.put_u32(0); // reserved
        extras.put_u64(offset.seqno);
        extras.put_u64(end_seqno);
        extras.put_u64(offset.vbuuid);
        extras.put_u64(offset.snapshot.start_seqno);
        extras.put_u64(offset.snapshot.end_seqno);
        RequestBuilder::new(opcode::DCP_STREAM_REQ)
            .vbucket(vbucket)
            .extras(extras)
    }

    /// Observe-seqno for the given branch uuid of a partition.
    pub fn observe_seqno(vbucket: u16, vbuuid: u64) -> RequestBuilder {
        RequestBuilder::new(opcode::OBSERVE_SEQNO)
            .vbucket(vbucket)
            .value(vbuuid.to_be_bytes().to_vec())
    }

    /// Read the failover log of a partition.
    pub fn failover_log(vbucket: u16) -> RequestBuilder {
        RequestBuilder::new(opcode::DCP_FAILOVER_LOG).vbucket(vbucket)
    }

    /// Report `bytes` consumed to the server's flow controller.
    pub fn buffer_ack(bytes: u32) -> RequestBuilder {
        let mut extras = Vec::with_capacity(4);
        extras.put_u32(bytes);
        RequestBuilder::new(opcode::DCP_BUFFER_ACK).extras(extras)
    }

    /// Negotiate a connection-level control setting.
    pub fn control(key: &str, value: &str) -> RequestBuilder {
        RequestBuilder::new(opcode::DCP_CONTROL)
            .key(key.as_bytes().to_vec())
            .value(value.as_bytes().to_vec())
    }

    /// Open a named producer connection.
    pub fn open_connection(name: &str) -> RequestBuilder {
        let mut extras = Vec::with_capacity(8);
        extras.put_u32(0); // seqno, unused
        extras.put_u32(OPEN_FLAG_PRODUCER);
        RequestBuilder::new(opcode::DCP_OPEN)
            .extras(extras)
            .key(name.as_bytes().to_vec())
    }

    /// SASL PLAIN authentication.
    pub fn sasl_auth_plain(username: &str, password: &str) -> RequestBuilder {
        let mut value = Vec::with_capacity(username.len() + password.len() + 2);
        value.push(0);
        value.extend_from_slice(username.as_bytes());
        value.push(0);
        value.extend_from_slice(password.as_bytes());
        RequestBuilder::new(opcode::SASL_AUTH)
            .key(b"PLAIN".to_vec())
            .value(value)
    }
}
