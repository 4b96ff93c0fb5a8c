//! Binary decoder: walks a raw perf record with the C struct layout the
//! generator emitted and renders it as a JSON-shaped byte buffer.
//!
//! Every field value is followed by a comma, including the last one before
//! the appended `"Timestamp"`; the egress scanners rely on that delimiter.

use std::fmt::Write;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use thiserror::Error;

use crate::fields::{self, CType, DType};

#[derive(Debug, Error)]
pub enum DecodeError {
    /// Configuration / code-gen mismatch; unrecoverable for the stream.
    #[error("corrupt schema: unknown field {0}")]
    CorruptSchema(String),
    /// Record shorter than the configured layout; the record is dropped.
    #[error("record truncated at field {0}")]
    Truncated(String),
}

struct DecodeField {
    name: String,
    ctype: CType,
    dtype: DType,
    big_endian: bool,
}

/// One decoder instance per (tracepoint, inet-family, worker). Holds the
/// resolved field sequence so the hot loop does no catalog lookups.
pub struct Decoder {
    fields: Vec<DecodeField>,
}

impl Decoder {
    pub fn new(names: &[String], v4: bool) -> Result<Self, DecodeError> {
        let mut resolved = Vec::with_capacity(names.len());

        for name in names {
            let spec = fields::spec(name, v4)
                .ok_or_else(|| DecodeError::CorruptSchema(name.clone()))?;
            resolved.push(DecodeField {
                name: name.clone(),
                ctype: spec.ctype,
                dtype: spec.dtype,
                big_endian: spec.big_endian,
            });
        }

        Ok(Self { fields: resolved })
    }

    /// Decodes one record into `buf`. The caller clears the buffer first.
    pub fn decode(&self, data: &[u8], buf: &mut BytesMut) -> Result<(), DecodeError> {
        self.decode_at(data, buf, unix_now())
    }

    fn decode_at(&self, data: &[u8], buf: &mut BytesMut, timestamp: u64) -> Result<(), DecodeError> {
        let mut cursor = 0usize;

        buf.extend_from_slice(b"{");

        for field in &self.fields {
            let width = field.ctype.width();
            let align = field.ctype.align();

            // natural alignment: round the cursor up to the member's C
            // alignment (comm arrays are byte-aligned, so only scalars pad)
            if align > 1 && cursor % align != 0 {
                cursor += align - cursor % align;
            }
            let end = cursor + width;
            if end > data.len() {
                return Err(DecodeError::Truncated(field.name.clone()));
            }
            let raw = &data[cursor..end];
            cursor = end;

            buf.extend_from_slice(b"\"");
            buf.extend_from_slice(field.name.as_bytes());
            buf.extend_from_slice(b"\":");

            match field.ctype {
                CType::U8 => {
                    let _ = write!(buf, "{}", raw[0]);
                }
                CType::U16 => {
                    let v = if field.big_endian {
                        u16::from_be_bytes([raw[0], raw[1]])
                    } else {
                        u16::from_le_bytes([raw[0], raw[1]])
                    };
                    let _ = write!(buf, "{v}");
                }
                CType::U32 => {
                    if field.dtype == DType::Ip {
                        let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
                        let _ = write!(buf, "\"{ip}\"");
                    } else {
                        let bytes = [raw[0], raw[1], raw[2], raw[3]];
                        let v = if field.big_endian {
                            u32::from_be_bytes(bytes)
                        } else {
                            u32::from_le_bytes(bytes)
                        };
                        let _ = write!(buf, "{v}");
                    }
                }
                CType::U64 => {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(raw);
                    let v = if field.big_endian {
                        u64::from_be_bytes(bytes)
                    } else {
                        u64::from_le_bytes(bytes)
                    };
                    let _ = write!(buf, "{v}");
                }
                CType::U128 => {
                    let mut bytes = [0u8; 16];
                    bytes.copy_from_slice(raw);
                    let ip = Ipv6Addr::from(bytes);
                    let _ = write!(buf, "\"{ip}\"");
                }
                CType::Char => {
                    let comm = raw.split(|b| *b == 0).next().unwrap_or(raw);
                    buf.extend_from_slice(b"\"");
                    buf.extend_from_slice(&String::from_utf8_lossy(comm).into_owned().into_bytes());
                    buf.extend_from_slice(b"\"");
                }
            }

            buf.extend_from_slice(b",");
        }

        let _ = write!(buf, "\"Timestamp\":{timestamp}");
        buf.extend_from_slice(b"}");

        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
