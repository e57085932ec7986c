//! Minimal XDR-style codec used for service negotiation messages and the
//! key-setup control protocol: big-endian 32-bit integers and 4-byte
//! padded, length-prefixed opaque data / UTF-8 strings.

use bytes::{Buf, BufMut};
use skein_core::{Error, Result};

#[derive(Debug, Default)]
pub struct XdrWriter {
    buf: Vec<u8>,
}

impl XdrWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.buf.put_i32(v);
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32(v);
        self
    }

    pub fn put_opaque(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_u32(data.len() as u32);
        self.buf.put_slice(data);
        let pad = (4 - (data.len() & 3)) & 3;
        self.buf.put_bytes(0, pad);
        self
    }

    pub fn put_string(&mut self, s: &str) -> &mut Self {
        self.put_opaque(s.as_bytes())
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

#[derive(Debug)]
pub struct XdrReader<'a> {
    buf: &'a [u8],
}

impl<'a> XdrReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        if self.buf.remaining() < 4 {
            return Err(Error::protocol("truncated xdr stream"));
        }
        Ok(self.buf.get_i32())
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        if self.buf.remaining() < 4 {
            return Err(Error::protocol("truncated xdr stream"));
        }
        Ok(self.buf.get_u32())
    }

    pub fn get_opaque(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        let padded = len + ((4 - (len & 3)) & 3);
        if self.buf.remaining() < padded {
            return Err(Error::protocol("xdr opaque runs past end"));
        }
        let data = self.buf[..len].to_vec();
        self.buf.advance(padded);
        Ok(data)
    }

    pub fn get_string(&mut self) -> Result<String> {
        let raw = self.get_opaque()?;
        String::from_utf8(raw).map_err(|_| Error::protocol("xdr string is not utf-8"))
    }
}

/// Service negotiation messages exchanged as the first messages on a
/// freshly connected stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceMsg {
    ConnectRequest { service: String, protocol: String },
    ConnectReply { code: i32, err: i32 },
}

impl ServiceMsg {
    pub fn request(service: &str, protocol: &str) -> Vec<u8> {
        let mut w = XdrWriter::new();
        w.put_i32(crate::proto::CONNECT_REQUEST)
            .put_string(service)
            .put_string(protocol);
        w.finish()
    }

    pub fn reply(err: i32) -> Vec<u8> {
        let mut w = XdrWriter::new();
        w.put_i32(crate::proto::CONNECT_REPLY).put_i32(err);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<ServiceMsg> {
        let mut r = XdrReader::new(buf);
        let code = r.get_i32()?;
        match code {
            crate::proto::CONNECT_REQUEST => Ok(ServiceMsg::ConnectRequest {
                service: r.get_string()?,
                protocol: r.get_string()?,
            }),
            crate::proto::CONNECT_REPLY => Ok(ServiceMsg::ConnectReply {
                code,
                err: r.get_i32()?,
            }),
            other => Err(Error::protocol(format!("unknown service message code {other:#x}"))),
        }
    }
}
