//! Landing payload envelope
//!
//! Raw vendor records are stored as a self-describing byte envelope:
//!
//! ```text
//! +-------+---------+------+-------------+-----------------+
//! | "SRC" | version | kind | len (u32BE) | JSON body (len) |
//! +-------+---------+------+-------------+-----------------+
//! ```
//!
//! Staging decodes through the versioned schema in `sources::types`, so a
//! change in the vendor's wire format shows up here as a new version
//! instead of leaking into the canonical model.

use crate::db::sqlite::models::EntityKind;
use crate::error::{AppError, Result};
use crate::sources::types::{CandlesResponse, CompanyProfile, Stock};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

const MAGIC: &[u8; 3] = b"SRC";
const HEADER_LEN: usize = 3 + 1 + 1 + 4;

pub const CURRENT_VERSION: u8 = 1;

/// Decoded landing payload
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Stock(Stock),
    Candles(CandlesResponse),
    CompanyProfile(CompanyProfile),
}

impl Payload {
    pub fn kind(&self) -> EntityKind {
        match self {
            Payload::Stock(_) => EntityKind::Stock,
            Payload::Candles(_) => EntityKind::Candle,
            Payload::CompanyProfile(_) => EntityKind::CompanyProfile,
        }
    }

    /// Encode with the current schema version
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = match self {
            Payload::Stock(v) => serde_json::to_vec(v)?,
            Payload::Candles(v) => serde_json::to_vec(v)?,
            Payload::CompanyProfile(v) => serde_json::to_vec(v)?,
        };

        let len = u32::try_from(body.len())
            .map_err(|_| AppError::Payload(format!("body too large: {} bytes", body.len())))?;

        let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
        buf.extend_from_slice(MAGIC);
        buf.write_u8(CURRENT_VERSION)?;
        buf.write_u8(self.kind().code())?;
        buf.write_u32::<BigEndian>(len)?;
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Decode an envelope that is expected to hold `expected` records
    pub fn decode(bytes: &[u8], expected: EntityKind) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(AppError::Payload(format!(
                "truncated header: {} bytes",
                bytes.len()
            )));
        }

        let mut cursor = Cursor::new(bytes);
        let mut magic = [0u8; 3];
        cursor.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(AppError::Payload(format!("bad magic {:?}", magic)));
        }

        let version = cursor.read_u8()?;
        let code = cursor.read_u8()?;
        let len = cursor.read_u32::<BigEndian>()? as usize;

        let kind = EntityKind::from_code(code)
            .ok_or_else(|| AppError::Payload(format!("unknown entity code {}", code)))?;
        if kind != expected {
            return Err(AppError::Payload(format!(
                "expected {} payload, found {}",
                expected.name(),
                kind.name()
            )));
        }

        let body = &bytes[HEADER_LEN..];
        if body.len() != len {
            return Err(AppError::Payload(format!(
                "length prefix {} does not match body of {} bytes",
                len,
                body.len()
            )));
        }

        match version {
            1 => decode_v1(body, kind),
            other => Err(AppError::Payload(format!(
                "unsupported payload version {}",
                other
            ))),
        }
    }
}

fn decode_v1(body: &[u8], kind: EntityKind) -> Result<Payload> {
    Ok(match kind {
        EntityKind::Stock => Payload::Stock(serde_json::from_slice(body)?),
        EntityKind::Candle => Payload::Candles(serde_json::from_slice(body)?),
        EntityKind::CompanyProfile => Payload::CompanyProfile(serde_json::from_slice(body)?),
    })
}
