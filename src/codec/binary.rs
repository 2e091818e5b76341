//! The binary BAM record codec.
//!
//! A record is a fixed 32-byte little-endian header block followed by the
//! NUL-terminated read name, packed CIGAR operations, 4-bit packed bases,
//! one quality byte per base and typed auxiliary data. On the wire each
//! record is prefixed with a 4-byte remaining-length (`block_size`).

use bstr::BString;

use crate::cigar::Cigar;
use crate::codec::{decode_hex, malformed};
use crate::errors::Result;
use crate::index::reg2bin;
use crate::record::{AlignmentRecord, AuxArray, AuxTag, AuxValue};
use crate::sequence::PackedSequence;

/// Size of the fixed per-record header block.
pub const FIXED_BLOCK_LEN: usize = 32;

/// Bin value carried by unmapped records.
const UNMAPPED_BIN: u16 = 4680;

/// Longest representable read name (`l_read_name` is a `u8` and includes
/// the NUL terminator).
pub const MAX_NAME_LEN: usize = 254;

/// Decodes one record from `buf`, which holds exactly the record's
/// `block_size` bytes (the 4-byte length prefix already consumed).
///
/// # Errors
///
/// [`SamBamError::MalformedRecord`](crate::SamBamError::MalformedRecord)
/// when the declared CIGAR operation count or sequence length disagrees
/// with the record size, or any embedded field fails to parse. The caller
/// has already consumed the declared length, so it may skip the record and
/// continue.
pub fn decode_record(buf: &[u8], ordinal: u64) -> Result<AlignmentRecord> {
    if buf.len() < FIXED_BLOCK_LEN {
        return Err(malformed(
            ordinal,
            format!("record of {} bytes is shorter than the fixed header block", buf.len()),
        ));
    }

    let ref_id = read_i32(buf, 0);
    let pos = read_i32(buf, 4);
    let l_read_name = buf[8] as usize;
    let mapq = buf[9];
    // buf[10..12] is the bin, recomputed on encode.
    let n_cigar_op = u16::from_le_bytes([buf[12], buf[13]]) as usize;
    let flag = u16::from_le_bytes([buf[14], buf[15]]);
    let l_seq = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]) as usize;
    let mate_ref_id = read_i32(buf, 20);
    let mate_pos = read_i32(buf, 24);
    let template_len = read_i32(buf, 28);

    if l_read_name == 0 {
        return Err(malformed(ordinal, "read name length of zero"));
    }

    let name_end = FIXED_BLOCK_LEN + l_read_name;
    let cigar_end = name_end + n_cigar_op * 4;
    let seq_end = cigar_end + l_seq.div_ceil(2);
    let qual_end = seq_end + l_seq;
    if qual_end > buf.len() {
        return Err(malformed(
            ordinal,
            format!(
                "declared name/CIGAR/sequence lengths need {qual_end} bytes but the record has {}",
                buf.len()
            ),
        ));
    }

    let mut record = AlignmentRecord {
        name: BString::from(&buf[FIXED_BLOCK_LEN..name_end - 1]),
        flags: flag,
        ref_id,
        pos,
        mapq,
        mate_ref_id,
        mate_pos,
        template_len,
        ..AlignmentRecord::default()
    };

    let raw_ops: Vec<u32> = buf[name_end..cigar_end]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    record.cigar = Cigar::from_packed(&raw_ops).map_err(|e| malformed(ordinal, e.to_string()))?;

    record.seq = PackedSequence::from_packed(buf[cigar_end..seq_end].to_vec(), l_seq)
        .expect("length checked above");

    // A 0xFF run marks absent qualities.
    if l_seq > 0 && buf[seq_end] != 0xff {
        record.qual = Some(buf[seq_end..qual_end].to_vec());
    }

    record.tags = decode_tags(&buf[qual_end..], ordinal)?;

    Ok(record)
}

/// Encodes a record, appending its 4-byte `block_size` prefix and payload
/// to `dst`.
///
/// # Errors
///
/// [`SamBamError::MalformedRecord`](crate::SamBamError::MalformedRecord)
/// when the record cannot be represented: a read name over
/// [`MAX_NAME_LEN`] bytes, too many CIGAR operations, an over-long
/// operation, or a quality array that disagrees with the sequence length.
pub fn encode_record(record: &AlignmentRecord, dst: &mut Vec<u8>, ordinal: u64) -> Result<()> {
    if record.name.len() > MAX_NAME_LEN {
        return Err(malformed(
            ordinal,
            format!("read name of {} bytes exceeds {MAX_NAME_LEN}", record.name.len()),
        ));
    }
    let n_cigar_op = u16::try_from(record.cigar.len())
        .map_err(|_| malformed(ordinal, "too many CIGAR operations"))?;
    if let Some(qual) = &record.qual {
        if qual.len() != record.seq.len() {
            return Err(malformed(
                ordinal,
                format!(
                    "quality length {} disagrees with sequence length {}",
                    qual.len(),
                    record.seq.len()
                ),
            ));
        }
    }

    let bin = match record.alignment_end() {
        Some(end) => reg2bin(record.pos as u64, end) as u16,
        None if record.is_mapped() => reg2bin(record.pos as u64, record.pos as u64 + 1) as u16,
        None => UNMAPPED_BIN,
    };

    let start = dst.len();
    dst.extend_from_slice(&[0u8; 4]); // block_size, patched below

    dst.extend_from_slice(&record.ref_id.to_le_bytes());
    dst.extend_from_slice(&record.pos.to_le_bytes());
    dst.push((record.name.len() + 1) as u8);
    dst.push(record.mapq);
    dst.extend_from_slice(&bin.to_le_bytes());
    dst.extend_from_slice(&n_cigar_op.to_le_bytes());
    dst.extend_from_slice(&record.flags.to_le_bytes());
    dst.extend_from_slice(&(record.seq.len() as u32).to_le_bytes());
    dst.extend_from_slice(&record.mate_ref_id.to_le_bytes());
    dst.extend_from_slice(&record.mate_pos.to_le_bytes());
    dst.extend_from_slice(&record.template_len.to_le_bytes());

    dst.extend_from_slice(record.name.as_slice());
    dst.push(0);

    for op in record.cigar.ops() {
        let packed = op.packed().map_err(|e| malformed(ordinal, e.to_string()))?;
        dst.extend_from_slice(&packed.to_le_bytes());
    }

    dst.extend_from_slice(record.seq.as_packed());
    match &record.qual {
        Some(qual) => dst.extend_from_slice(qual),
        None => dst.extend(std::iter::repeat(0xff).take(record.seq.len())),
    }

    for tag in &record.tags {
        encode_tag(tag, dst);
    }

    let block_size = (dst.len() - start - 4) as u32;
    dst[start..start + 4].copy_from_slice(&block_size.to_le_bytes());

    Ok(())
}

#[inline]
fn read_i32(buf: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn decode_tags(mut data: &[u8], ordinal: u64) -> Result<Vec<AuxTag>> {
    let mut tags = Vec::new();

    while !data.is_empty() {
        if data.len() < 3 {
            return Err(malformed(ordinal, "truncated auxiliary tag"));
        }
        let id = [data[0], data[1]];
        let val_type = data[2];
        data = &data[3..];

        let (value, used) = decode_tag_value(val_type, data, ordinal)?;
        tags.push(AuxTag::new(id, value));
        data = &data[used..];
    }

    Ok(tags)
}

fn decode_tag_value(val_type: u8, data: &[u8], ordinal: u64) -> Result<(AuxValue, usize)> {
    let short = || malformed(ordinal, "truncated auxiliary tag value");

    let fixed = |n: usize| {
        if data.len() < n { Err(short()) } else { Ok(&data[..n]) }
    };

    match val_type {
        b'A' => Ok((AuxValue::Char(*data.first().ok_or_else(&short)?), 1)),
        b'c' => Ok((AuxValue::Int8(fixed(1)?[0] as i8), 1)),
        b'C' => Ok((AuxValue::UInt8(fixed(1)?[0]), 1)),
        b's' => {
            let v = fixed(2)?;
            Ok((AuxValue::Int16(i16::from_le_bytes([v[0], v[1]])), 2))
        }
        b'S' => {
            let v = fixed(2)?;
            Ok((AuxValue::UInt16(u16::from_le_bytes([v[0], v[1]])), 2))
        }
        b'i' => {
            let v = fixed(4)?;
            Ok((AuxValue::Int32(i32::from_le_bytes([v[0], v[1], v[2], v[3]])), 4))
        }
        b'I' => {
            let v = fixed(4)?;
            Ok((AuxValue::UInt32(u32::from_le_bytes([v[0], v[1], v[2], v[3]])), 4))
        }
        b'f' => {
            let v = fixed(4)?;
            Ok((AuxValue::Float(f32::from_le_bytes([v[0], v[1], v[2], v[3]])), 4))
        }
        b'Z' => {
            let nul = data.iter().position(|&b| b == 0).ok_or_else(&short)?;
            Ok((AuxValue::String(BString::from(&data[..nul])), nul + 1))
        }
        b'H' => {
            let nul = data.iter().position(|&b| b == 0).ok_or_else(&short)?;
            let bytes = decode_hex(&data[..nul])
                .ok_or_else(|| malformed(ordinal, "invalid hex tag value"))?;
            Ok((AuxValue::Hex(bytes), nul + 1))
        }
        b'B' => {
            let header = fixed(5)?;
            let elem_type = header[0];
            let count = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
            let (array, elem_size) = decode_array(elem_type, &data[5..], count, ordinal)?;
            Ok((AuxValue::Array(array), 5 + count * elem_size))
        }
        other => Err(malformed(
            ordinal,
            format!("unsupported auxiliary tag type 0x{other:02x}"),
        )),
    }
}

fn decode_array(
    elem_type: u8,
    data: &[u8],
    count: usize,
    ordinal: u64,
) -> Result<(AuxArray, usize)> {
    fn collect<T, const N: usize>(
        data: &[u8],
        count: usize,
        ordinal: u64,
        from_le: impl Fn([u8; N]) -> T,
    ) -> Result<Vec<T>> {
        if data.len() < count * N {
            return Err(malformed(ordinal, "truncated auxiliary array"));
        }
        Ok(data[..count * N]
            .chunks_exact(N)
            .map(|c| from_le(c.try_into().expect("chunk size matches N")))
            .collect())
    }

    match elem_type {
        b'c' => Ok((AuxArray::Int8(collect(data, count, ordinal, |b: [u8; 1]| b[0] as i8)?), 1)),
        b'C' => Ok((AuxArray::UInt8(collect(data, count, ordinal, |b: [u8; 1]| b[0])?), 1)),
        b's' => Ok((AuxArray::Int16(collect(data, count, ordinal, i16::from_le_bytes)?), 2)),
        b'S' => Ok((AuxArray::UInt16(collect(data, count, ordinal, u16::from_le_bytes)?), 2)),
        b'i' => Ok((AuxArray::Int32(collect(data, count, ordinal, i32::from_le_bytes)?), 4)),
        b'I' => Ok((AuxArray::UInt32(collect(data, count, ordinal, u32::from_le_bytes)?), 4)),
        b'f' => Ok((AuxArray::Float(collect(data, count, ordinal, f32::from_le_bytes)?), 4)),
        other => Err(malformed(
            ordinal,
            format!("unsupported auxiliary array element type 0x{other:02x}"),
        )),
    }
}


fn encode_tag(tag: &AuxTag, dst: &mut Vec<u8>) {
    use std::io::Write as _;

    dst.extend_from_slice(&tag.id);
    match &tag.value {
        AuxValue::Char(c) => {
            dst.push(b'A');
            dst.push(*c);
        }
        AuxValue::Int8(n) => {
            dst.push(b'c');
            dst.push(*n as u8);
        }
        AuxValue::UInt8(n) => {
            dst.push(b'C');
            dst.push(*n);
        }
        AuxValue::Int16(n) => {
            dst.push(b's');
            dst.extend_from_slice(&n.to_le_bytes());
        }
        AuxValue::UInt16(n) => {
            dst.push(b'S');
            dst.extend_from_slice(&n.to_le_bytes());
        }
        AuxValue::Int32(n) => {
            dst.push(b'i');
            dst.extend_from_slice(&n.to_le_bytes());
        }
        AuxValue::UInt32(n) => {
            dst.push(b'I');
            dst.extend_from_slice(&n.to_le_bytes());
        }
        AuxValue::Float(x) => {
            dst.push(b'f');
            dst.extend_from_slice(&x.to_le_bytes());
        }
        AuxValue::String(s) => {
            dst.push(b'Z');
            dst.extend_from_slice(s.as_slice());
            dst.push(0);
        }
        AuxValue::Hex(bytes) => {
            dst.push(b'H');
            for b in bytes {
                let _ = write!(dst, "{b:02X}");
            }
            dst.push(0);
        }
        AuxValue::Array(array) => {
            dst.push(b'B');
            dst.push(array.element_type());
            dst.extend_from_slice(&(array.len() as u32).to_le_bytes());
            encode_array_elements(array, dst);
        }
    }
}

fn encode_array_elements(array: &AuxArray, dst: &mut Vec<u8>) {
    match array {
        AuxArray::Int8(v) => dst.extend(v.iter().map(|&n| n as u8)),
        AuxArray::UInt8(v) => dst.extend_from_slice(v),
        AuxArray::Int16(v) => v.iter().for_each(|n| dst.extend_from_slice(&n.to_le_bytes())),
        AuxArray::UInt16(v) => v.iter().for_each(|n| dst.extend_from_slice(&n.to_le_bytes())),
        AuxArray::Int32(v) => v.iter().for_each(|n| dst.extend_from_slice(&n.to_le_bytes())),
        AuxArray::UInt32(v) => v.iter().for_each(|n| dst.extend_from_slice(&n.to_le_bytes())),
        AuxArray::Float(v) => v.iter().for_each(|x| dst.extend_from_slice(&x.to_le_bytes())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cigar::{CigarOp, CigarOpKind};
    use crate::errors::SamBamError;
    use crate::record::flags;

    fn mapped_record() -> AlignmentRecord {
        AlignmentRecord {
            name: "read1".into(),
            flags: flags::PAIRED | flags::FIRST_SEGMENT,
            ref_id: 2,
            pos: 200,
            mapq: 42,
            cigar: [CigarOp::new(5, CigarOpKind::SoftClip), CigarOp::new(10, CigarOpKind::Match)]
                .into_iter()
                .collect(),
            mate_ref_id: 2,
            mate_pos: 400,
            template_len: 215,
            seq: PackedSequence::from_ascii(b"ACGTACGTACGTACN"),
            qual: Some(vec![30; 15]),
            tags: vec![
                AuxTag::new(*b"NM", AuxValue::UInt8(1)),
                AuxTag::new(*b"RG", AuxValue::String("lane1".into())),
                AuxTag::new(*b"XB", AuxValue::Array(AuxArray::Int16(vec![-1, 300]))),
            ],
        }
    }

    fn encode_payload(record: &AlignmentRecord) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_record(record, &mut buf, 0).unwrap();
        let block_size = u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;
        assert_eq!(block_size, buf.len() - 4);
        buf.split_off(4)
    }

    #[test]
    fn test_roundtrip_mapped_record() {
        let record = mapped_record();
        let payload = encode_payload(&record);
        let decoded = decode_record(&payload, 0).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_roundtrip_absent_quality() {
        let mut record = mapped_record();
        record.qual = None;
        let payload = encode_payload(&record);
        // Quality bytes are a 0xFF run on the wire.
        let decoded = decode_record(&payload, 0).unwrap();
        assert_eq!(decoded.qual, None);
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_unmapped_record_layout() {
        let record = AlignmentRecord {
            name: "*".into(),
            flags: flags::UNMAPPED,
            ref_id: -1,
            pos: -1,
            mapq: 0xff,
            mate_ref_id: -1,
            mate_pos: -1,
            ..AlignmentRecord::default()
        };
        let payload = encode_payload(&record);
        assert_eq!(
            payload,
            [
                0xff, 0xff, 0xff, 0xff, // ref_id = -1
                0xff, 0xff, 0xff, 0xff, // pos = -1
                0x02, // l_read_name = 2
                0xff, // mapq = 255
                0x48, 0x12, // bin = 4680
                0x00, 0x00, // n_cigar_op = 0
                0x04, 0x00, // flag = UNMAPPED
                0x00, 0x00, 0x00, 0x00, // l_seq = 0
                0xff, 0xff, 0xff, 0xff, // next_ref_id = -1
                0xff, 0xff, 0xff, 0xff, // next_pos = -1
                0x00, 0x00, 0x00, 0x00, // tlen = 0
                0x2a, 0x00, // read_name = "*\0"
            ]
        );
        assert_eq!(decode_record(&payload, 0).unwrap(), record);
    }

    #[test]
    fn test_bin_computed_from_span() {
        let record = AlignmentRecord {
            name: "r".into(),
            ref_id: 0,
            pos: 100,
            cigar: [CigarOp::new(100, CigarOpKind::Match)].into_iter().collect(),
            mate_ref_id: -1,
            mate_pos: -1,
            seq: PackedSequence::from_ascii(&vec![b'A'; 100]),
            ..AlignmentRecord::default()
        };
        let payload = encode_payload(&record);
        let bin = u16::from_le_bytes([payload[10], payload[11]]);
        // [100, 200) sits entirely inside the first 16kb leaf bin.
        assert_eq!(bin, 4681);
    }

    #[test]
    fn test_decode_rejects_short_record() {
        assert!(matches!(
            decode_record(&[0u8; 16], 9),
            Err(SamBamError::MalformedRecord { ordinal: 9, .. })
        ));
    }

    #[test]
    fn test_decode_rejects_length_disagreement() {
        let record = mapped_record();
        let mut payload = encode_payload(&record);
        // Claim 100 CIGAR operations; the declared sizes now outrun the
        // record, which must fail rather than read out of bounds.
        payload[12..14].copy_from_slice(&100u16.to_le_bytes());
        assert!(matches!(
            decode_record(&payload, 0),
            Err(SamBamError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_bad_cigar_opcode() {
        let record = AlignmentRecord {
            name: "r".into(),
            ref_id: 0,
            pos: 10,
            cigar: [CigarOp::new(4, CigarOpKind::Match)].into_iter().collect(),
            mate_ref_id: -1,
            mate_pos: -1,
            ..AlignmentRecord::default()
        };
        let mut payload = encode_payload(&record);
        let cigar_off = FIXED_BLOCK_LEN + 2; // name "r" + NUL
        payload[cigar_off] = (4 << 4) | 0x09; // opcode 9 is out of table
        assert!(matches!(
            decode_record(&payload, 0),
            Err(SamBamError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_name() {
        let record = AlignmentRecord {
            name: vec![b'x'; MAX_NAME_LEN + 1].into(),
            ref_id: -1,
            pos: -1,
            mate_ref_id: -1,
            mate_pos: -1,
            ..AlignmentRecord::default()
        };
        let mut buf = Vec::new();
        assert!(matches!(
            encode_record(&record, &mut buf, 0),
            Err(SamBamError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn test_tag_payload_roundtrip() {
        let mut record = mapped_record();
        record.tags = vec![
            AuxTag::new(*b"XA", AuxValue::Char(b'c')),
            AuxTag::new(*b"X1", AuxValue::Int8(-5)),
            AuxTag::new(*b"X2", AuxValue::UInt16(65535)),
            AuxTag::new(*b"X3", AuxValue::Int32(-100_000)),
            AuxTag::new(*b"X4", AuxValue::Float(1.5)),
            AuxTag::new(*b"XH", AuxValue::Hex(vec![0xde, 0xad])),
            AuxTag::new(*b"XF", AuxValue::Array(AuxArray::Float(vec![0.5, -2.0]))),
        ];
        let payload = encode_payload(&record);
        assert_eq!(decode_record(&payload, 0).unwrap().tags, record.tags);
    }

    #[test]
    fn test_decode_truncated_tag() {
        let record = AlignmentRecord {
            name: "r".into(),
            ref_id: -1,
            pos: -1,
            mate_ref_id: -1,
            mate_pos: -1,
            ..AlignmentRecord::default()
        };
        let mut payload = encode_payload(&record);
        payload.extend_from_slice(b"NM"); // tag id with no type byte
        assert!(matches!(
            decode_record(&payload, 0),
            Err(SamBamError::MalformedRecord { .. })
        ));
    }
}
