//! Versioned binary layout of persisted tuning records.
//!
//! ```text
//! magic    8 bytes  "GEMMTUNE"
//! version  u32
//! count    u32
//! count x record:
//!   kind        u8
//!   layout      u32
//!   batch_size  u32
//!   input_dim   u32
//!   output_dim  u32
//!   num_experts u32
//!   variant_id  u16
//!   cost_us     f64
//! ```
//!
//! All integers and floats are little-endian.

use std::io::{self, Read, Write};

use crate::error::{DispatchError, Result};
use crate::tuning::signature::{ProblemSignature, TuningRecord};
use crate::variant::{KernelVariant, OperationKind};
use crate::weight::LayoutTag;

pub const MAGIC: [u8; 8] = *b"GEMMTUNE";
pub const VERSION: u32 = 1;

/// Encoded size of one record.
pub const RECORD_BYTES: usize = 1 + 4 * 5 + 2 + 8;

// Upper bound on the up-front allocation for a claimed record count.
const MAX_PREALLOC: usize = 4096;

pub fn write_records<'a, W, I>(writer: &mut W, records: I) -> Result<usize>
where
    W: Write,
    I: ExactSizeIterator<Item = &'a TuningRecord>,
{
    let count = u32::try_from(records.len())
        .map_err(|_| DispatchError::corrupt("too many records to export"))?;

    writer.write_all(&MAGIC)?;
    writer.write_all(&VERSION.to_le_bytes())?;
    writer.write_all(&count.to_le_bytes())?;

    let mut buf = [0u8; RECORD_BYTES];
    let mut written = 0;
    for record in records {
        encode_record(record, &mut buf);
        writer.write_all(&buf)?;
        written += 1;
    }
    writer.flush()?;
    Ok(written)
}

/// Read a complete stream. Nothing is returned unless every record parsed.
pub fn read_records<R: Read>(reader: &mut R) -> Result<Vec<TuningRecord>> {
    let mut magic = [0u8; 8];
    read_exact(reader, &mut magic, "header")?;
    if magic != MAGIC {
        return Err(DispatchError::corrupt("bad magic"));
    }

    let version = read_u32(reader, "version")?;
    if version != VERSION {
        return Err(DispatchError::corrupt(format!(
            "unsupported version {version}, expected {VERSION}"
        )));
    }

    let count = read_u32(reader, "record count")? as usize;
    let mut records = Vec::with_capacity(count.min(MAX_PREALLOC));
    let mut buf = [0u8; RECORD_BYTES];
    for i in 0..count {
        read_exact(reader, &mut buf, "record")?;
        let record = decode_record(&buf)
            .map_err(|e| DispatchError::corrupt(format!("record {i}: {e}")))?;
        records.push(record);
    }
    Ok(records)
}

fn encode_record(record: &TuningRecord, buf: &mut [u8; RECORD_BYTES]) {
    let sig = &record.signature;
    buf[0] = sig.kind.code();
    buf[1..5].copy_from_slice(&sig.layout.to_bits().to_le_bytes());
    buf[5..9].copy_from_slice(&sig.batch_size.to_le_bytes());
    buf[9..13].copy_from_slice(&sig.input_dim.to_le_bytes());
    buf[13..17].copy_from_slice(&sig.output_dim.to_le_bytes());
    buf[17..21].copy_from_slice(&sig.num_experts.to_le_bytes());
    buf[21..23].copy_from_slice(&record.variant.id().to_le_bytes());
    buf[23..31].copy_from_slice(&record.cost_us.to_le_bytes());
}

fn decode_record(buf: &[u8; RECORD_BYTES]) -> std::result::Result<TuningRecord, String> {
    let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);

    let kind = OperationKind::from_code(buf[0])
        .ok_or_else(|| format!("unknown operation kind {}", buf[0]))?;
    let layout = LayoutTag::from_bits(u32_at(1)).map_err(|e| e.to_string())?;
    let variant_id = u16::from_le_bytes([buf[21], buf[22]]);
    let variant =
        KernelVariant::from_id(variant_id).ok_or_else(|| format!("unknown variant {variant_id}"))?;
    let mut cost = [0u8; 8];
    cost.copy_from_slice(&buf[23..31]);
    let cost_us = f64::from_le_bytes(cost);
    if !cost_us.is_finite() || cost_us < 0.0 {
        return Err(format!("invalid cost {cost_us}"));
    }

    Ok(TuningRecord {
        signature: ProblemSignature {
            kind,
            batch_size: u32_at(5),
            input_dim: u32_at(9),
            output_dim: u32_at(13),
            layout,
            num_experts: u32_at(17),
        },
        variant,
        cost_us,
    })
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => DispatchError::corrupt(format!("truncated {what}")),
        _ => DispatchError::Io(e),
    })
}

fn read_u32<R: Read>(reader: &mut R, what: &str) -> Result<u32> {
    let mut b = [0u8; 4];
    read_exact(reader, &mut b, what)?;
    Ok(u32::from_le_bytes(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    use crate::variant::{Fusion, TileShape};
    use crate::weight::WeightFormat;

    fn record(batch: u32, variant: KernelVariant, cost: f64) -> TuningRecord {
        TuningRecord {
            signature: ProblemSignature {
                kind: OperationKind::FusedSiluFfn,
                batch_size: batch,
                input_dim: 4096,
                output_dim: 22016,
                layout: LayoutTag::new(DType::F16, WeightFormat::Int4Awq),
                num_experts: 8,
            },
            variant,
            cost_us: cost,
        }
    }

    fn encode(records: &[TuningRecord]) -> Vec<u8> {
        let mut buf = Vec::new();
        write_records(&mut buf, records.iter()).unwrap();
        buf
    }

    #[test]
    fn test_header_layout() {
        let buf = encode(&[]);
        assert_eq!(&buf[..8], b"GEMMTUNE");
        assert_eq!(u32::from_le_bytes(buf[8..12].try_into().unwrap()), VERSION);
        assert_eq!(u32::from_le_bytes(buf[12..16].try_into().unwrap()), 0);
        assert_eq!(buf.len(), 16);
    }

    #[test]
    fn test_record_size() {
        let r = record(16, KernelVariant::DEFAULT, 12.5);
        assert_eq!(encode(&[r]).len(), 16 + RECORD_BYTES);
    }

    #[test]
    fn test_decode_preserves_fields() {
        let variant = KernelVariant::new(Fusion::FusedSiluFfn, TileShape::Large);
        let r = record(128, variant, 3.25);
        let decoded = read_records(&mut encode(&[r]).as_slice()).unwrap();
        assert_eq!(decoded, vec![r]);
    }

    #[test]
    fn test_truncated_stream_is_corrupt() {
        let buf = encode(&[record(1, KernelVariant::DEFAULT, 1.0)]);
        let err = read_records(&mut &buf[..buf.len() - 3]).unwrap_err();
        assert!(matches!(err, DispatchError::CorruptTuningData(_)));

        let err = read_records(&mut &buf[..5]).unwrap_err();
        assert!(matches!(err, DispatchError::CorruptTuningData(_)));
    }

    #[test]
    fn test_bad_magic_is_corrupt() {
        let mut buf = encode(&[]);
        buf[0] = b'X';
        let err = read_records(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, DispatchError::CorruptTuningData(_)));
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let mut buf = encode(&[record(1, KernelVariant::DEFAULT, 1.0)]);
        buf[8..12].copy_from_slice(&2u32.to_le_bytes());
        let err = read_records(&mut buf.as_slice()).unwrap_err();
        assert!(err.to_string().contains("unsupported version 2"));
    }

    #[test]
    fn test_unknown_variant_is_corrupt() {
        let mut buf = encode(&[record(1, KernelVariant::DEFAULT, 1.0)]);
        let at = 16 + 21;
        buf[at..at + 2].copy_from_slice(&999u16.to_le_bytes());
        let err = read_records(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, DispatchError::CorruptTuningData(_)));
    }

    #[test]
    fn test_negative_cost_is_corrupt() {
        let buf = encode(&[record(1, KernelVariant::DEFAULT, -1.0)]);
        assert!(read_records(&mut buf.as_slice()).is_err());
    }
}
