//! The tab-delimited SAM line codec.
//!
//! An alignment line carries 11 mandatory fields followed by optional
//! `TAG:TYPE:VALUE` tags. Text positions are 1-based (0 for unplaced);
//! in-memory positions are 0-based with -1 for absent. Quality characters
//! carry a +33 ASCII offset over the raw Phred scores held in the record.

use std::io::Write as _;
use std::str;

use bstr::BString;

use crate::cigar::Cigar;
use crate::codec::{decode_hex, malformed};
use crate::dict::ReferenceDictionary;
use crate::errors::{Result, SamBamError};
use crate::record::{AlignmentRecord, AuxArray, AuxTag, AuxValue};
use crate::sequence::PackedSequence;

/// Offset between raw Phred scores and their text representation.
const QUAL_OFFSET: u8 = 33;

/// Decodes one alignment line into a record, resolving reference names
/// through `dict`.
///
/// # Errors
///
/// [`SamBamError::MalformedRecord`] for a line that cannot be parsed
/// (the line is fully consumed either way, so the caller may skip and
/// continue); [`SamBamError::UnknownReference`] when RNAME or RNEXT names a
/// sequence missing from the dictionary.
pub fn decode_line(
    line: &[u8],
    dict: &mut ReferenceDictionary,
    ordinal: u64,
) -> Result<AlignmentRecord> {
    let fields: Vec<&[u8]> = line.split(|&b| b == b'\t').collect();
    if fields.len() < 11 {
        return Err(malformed(ordinal, format!("expected 11 fields, found {}", fields.len())));
    }

    let mut record = AlignmentRecord::new();
    record.name = BString::from(fields[0]);
    record.flags = parse_num(fields[1], "FLAG", ordinal)?;

    let pos_1based: i64 = parse_num(fields[3], "POS", ordinal)?;
    if fields[2] == b"*" {
        record.ref_id = -1;
        record.pos = -1;
    } else {
        record.ref_id = resolve_name(fields[2], dict)? - 1;
        record.pos = i32::try_from(pos_1based - 1)
            .map_err(|_| malformed(ordinal, "POS out of range"))?;
    }

    record.mapq = parse_num(fields[4], "MAPQ", ordinal)?;
    record.cigar = Cigar::from_text(fields[5]).map_err(|e| malformed(ordinal, e.to_string()))?;

    let pnext_1based: i64 = parse_num(fields[7], "PNEXT", ordinal)?;
    record.mate_ref_id = match fields[6] {
        b"*" => -1,
        b"=" => record.ref_id,
        name => resolve_name(name, dict)? - 1,
    };
    record.mate_pos = i32::try_from(pnext_1based - 1)
        .map_err(|_| malformed(ordinal, "PNEXT out of range"))?;
    record.template_len = parse_num(fields[8], "TLEN", ordinal)?;

    if fields[9] != b"*" {
        record.seq = PackedSequence::from_ascii(fields[9]);
    }
    if !record.seq.is_empty() && !record.cigar.is_empty() {
        let query_len = record.cigar.query_length();
        if query_len != record.seq.len() as u64 {
            return Err(malformed(
                ordinal,
                format!(
                    "CIGAR query length {query_len} disagrees with sequence length {}",
                    record.seq.len()
                ),
            ));
        }
    }

    if fields[10] != b"*" {
        if !record.seq.is_empty() && fields[10].len() != record.seq.len() {
            return Err(malformed(
                ordinal,
                format!(
                    "quality length {} disagrees with sequence length {}",
                    fields[10].len(),
                    record.seq.len()
                ),
            ));
        }
        let qual = fields[10]
            .iter()
            .map(|&c| c.checked_sub(QUAL_OFFSET).ok_or(()))
            .collect::<std::result::Result<Vec<u8>, ()>>()
            .map_err(|()| malformed(ordinal, "quality character below '!'"))?;
        record.qual = Some(qual);
    }

    for field in &fields[11..] {
        record.tags.push(decode_tag(field, ordinal)?);
    }

    Ok(record)
}

/// Encodes a record as one alignment line (without the trailing newline),
/// appending to `dst`.
///
/// # Errors
///
/// [`SamBamError::UnknownReference`] when the record's reference or mate
/// reference id is outside the dictionary.
pub fn encode_line(
    record: &AlignmentRecord,
    dict: &ReferenceDictionary,
    dst: &mut Vec<u8>,
) -> Result<()> {
    dst.extend_from_slice(record.name.as_slice());
    let _ = write!(dst, "\t{}\t", record.flags);

    if record.ref_id < 0 {
        dst.push(b'*');
    } else {
        dst.extend_from_slice(ref_name(dict, record.ref_id)?.as_bytes());
    }
    let _ = write!(dst, "\t{}\t{}\t", record.pos.max(-1) + 1, record.mapq);
    record.cigar.write_text(dst);
    dst.push(b'\t');

    if record.mate_ref_id < 0 {
        dst.push(b'*');
    } else if record.mate_ref_id == record.ref_id {
        dst.push(b'=');
    } else {
        dst.extend_from_slice(ref_name(dict, record.mate_ref_id)?.as_bytes());
    }
    let _ = write!(dst, "\t{}\t{}\t", record.mate_pos.max(-1) + 1, record.template_len);

    if record.seq.is_empty() {
        dst.push(b'*');
    } else {
        dst.extend_from_slice(&record.seq.to_ascii());
    }
    dst.push(b'\t');
    match &record.qual {
        None => dst.push(b'*'),
        Some(qual) => dst.extend(qual.iter().map(|&q| q + QUAL_OFFSET)),
    }

    for tag in &record.tags {
        dst.push(b'\t');
        encode_tag(tag, dst);
    }

    Ok(())
}

fn ref_name(dict: &ReferenceDictionary, ref_id: i32) -> Result<&str> {
    dict.by_bam_id(ref_id)
        .map(|seq| seq.name.as_str())
        .ok_or_else(|| SamBamError::UnknownReference { name: format!("id {ref_id}") })
}

fn resolve_name(name: &[u8], dict: &mut ReferenceDictionary) -> Result<i32> {
    let name = str::from_utf8(name)
        .map_err(|_| SamBamError::UnknownReference { name: String::from_utf8_lossy(name).into() })?;
    dict.lookup(name)
        .map(|id| id as i32)
        .ok_or_else(|| SamBamError::UnknownReference { name: name.to_string() })
}

fn parse_num<T: str::FromStr>(field: &[u8], what: &str, ordinal: u64) -> Result<T> {
    str::from_utf8(field)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| malformed(ordinal, format!("invalid {what} field")))
}

fn decode_tag(field: &[u8], ordinal: u64) -> Result<AuxTag> {
    let bad = |reason: &str| malformed(ordinal, format!("invalid tag field: {reason}"));

    if field.len() < 5 || field[2] != b':' || field[4] != b':' {
        return Err(bad("expected TAG:TYPE:VALUE"));
    }
    let id = [field[0], field[1]];
    let value = &field[5..];

    let value = match field[3] {
        b'A' => match value {
            [c] => AuxValue::Char(*c),
            _ => return Err(bad("'A' value must be a single character")),
        },
        b'i' => {
            let n: i64 = parse_num(value, "tag integer", ordinal)?;
            if let Ok(n) = i32::try_from(n) {
                AuxValue::Int32(n)
            } else if let Ok(n) = u32::try_from(n) {
                AuxValue::UInt32(n)
            } else {
                return Err(bad("integer out of 32-bit range"));
            }
        }
        b'f' => AuxValue::Float(parse_num(value, "tag float", ordinal)?),
        b'Z' => AuxValue::String(BString::from(value)),
        b'H' => AuxValue::Hex(decode_hex(value).ok_or_else(|| bad("invalid hex value"))?),
        b'B' => AuxValue::Array(decode_array(value, ordinal)?),
        other => return Err(bad(&format!("unsupported tag type '{}'", other as char))),
    };

    Ok(AuxTag::new(id, value))
}

fn decode_array(value: &[u8], ordinal: u64) -> Result<AuxArray> {
    let (&elem_type, rest) = value
        .split_first()
        .ok_or_else(|| malformed(ordinal, "invalid tag field: empty 'B' value"))?;
    let rest = rest.strip_prefix(b",").unwrap_or(rest);
    let items: Vec<&[u8]> =
        if rest.is_empty() { Vec::new() } else { rest.split(|&b| b == b',').collect() };

    fn collect<T: str::FromStr>(items: &[&[u8]], ordinal: u64) -> Result<Vec<T>> {
        items.iter().map(|item| parse_num(item, "tag array element", ordinal)).collect()
    }

    match elem_type {
        b'c' => Ok(AuxArray::Int8(collect(&items, ordinal)?)),
        b'C' => Ok(AuxArray::UInt8(collect(&items, ordinal)?)),
        b's' => Ok(AuxArray::Int16(collect(&items, ordinal)?)),
        b'S' => Ok(AuxArray::UInt16(collect(&items, ordinal)?)),
        b'i' => Ok(AuxArray::Int32(collect(&items, ordinal)?)),
        b'I' => Ok(AuxArray::UInt32(collect(&items, ordinal)?)),
        b'f' => Ok(AuxArray::Float(collect(&items, ordinal)?)),
        other => Err(malformed(
            ordinal,
            format!("invalid tag field: unsupported array element type '{}'", other as char),
        )),
    }
}


fn encode_tag(tag: &AuxTag, dst: &mut Vec<u8>) {
    dst.extend_from_slice(&tag.id);
    match &tag.value {
        AuxValue::Char(c) => {
            dst.extend_from_slice(b":A:");
            dst.push(*c);
        }
        // The text form has a single integer type regardless of width.
        AuxValue::Int8(n) => {
            let _ = write!(dst, ":i:{n}");
        }
        AuxValue::UInt8(n) => {
            let _ = write!(dst, ":i:{n}");
        }
        AuxValue::Int16(n) => {
            let _ = write!(dst, ":i:{n}");
        }
        AuxValue::UInt16(n) => {
            let _ = write!(dst, ":i:{n}");
        }
        AuxValue::Int32(n) => {
            let _ = write!(dst, ":i:{n}");
        }
        AuxValue::UInt32(n) => {
            let _ = write!(dst, ":i:{n}");
        }
        AuxValue::Float(x) => {
            let _ = write!(dst, ":f:{x}");
        }
        AuxValue::String(s) => {
            dst.extend_from_slice(b":Z:");
            dst.extend_from_slice(s.as_slice());
        }
        AuxValue::Hex(bytes) => {
            dst.extend_from_slice(b":H:");
            for b in bytes {
                let _ = write!(dst, "{b:02X}");
            }
        }
        AuxValue::Array(array) => {
            dst.extend_from_slice(b":B:");
            dst.push(array.element_type());
            encode_array_elements(array, dst);
        }
    }
}

fn encode_array_elements(array: &AuxArray, dst: &mut Vec<u8>) {
    fn write_all<T: std::fmt::Display>(items: &[T], dst: &mut Vec<u8>) {
        for item in items {
            let _ = write!(dst, ",{item}");
        }
    }

    match array {
        AuxArray::Int8(v) => write_all(v, dst),
        AuxArray::UInt8(v) => write_all(v, dst),
        AuxArray::Int16(v) => write_all(v, dst),
        AuxArray::UInt16(v) => write_all(v, dst),
        AuxArray::Int32(v) => write_all(v, dst),
        AuxArray::UInt32(v) => write_all(v, dst),
        AuxArray::Float(v) => write_all(v, dst),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cigar::{CigarOp, CigarOpKind};

    fn dict() -> ReferenceDictionary {
        let mut dict = ReferenceDictionary::new();
        dict.add("chr1", 1000);
        dict.add("chr2", 6000);
        dict
    }

    #[test]
    fn test_decode_minimal_line() {
        let mut dict = dict();
        let line = b"r1\t0\tchr1\t101\t60\t10M\t*\t0\t0\tACGTACGTAC\t*";
        let record = decode_line(line, &mut dict, 0).unwrap();

        assert_eq!(record.name, "r1");
        assert_eq!(record.flags, 0);
        assert_eq!(record.ref_id, 0);
        assert_eq!(record.pos, 100);
        assert_eq!(record.mapq, 60);
        assert_eq!(record.cigar.ops(), &[CigarOp::new(10, CigarOpKind::Match)]);
        assert_eq!(record.mate_ref_id, -1);
        assert_eq!(record.seq.len(), 10);
        assert_eq!(record.qual, None);
        assert!(record.tags.is_empty());
    }

    #[test]
    fn test_line_roundtrip_byte_for_byte() {
        let mut dict = dict();
        let line: &[u8] = b"r1\t0\tchr1\t101\t60\t10M\t*\t0\t0\tACGTACGTAC\t*";
        let record = decode_line(line, &mut dict, 0).unwrap();
        let mut out = Vec::new();
        encode_line(&record, &dict, &mut out).unwrap();
        assert_eq!(out, line);
    }

    #[test]
    fn test_roundtrip_with_mate_quality_and_tags() {
        let mut dict = dict();
        let line: &[u8] =
            b"r2\t99\tchr1\t151\t37\t5S5M\t=\t301\t200\tACGTACGTAC\tIIIIIHHHHH\tNM:i:2\tRG:Z:lane1";
        let record = decode_line(line, &mut dict, 3).unwrap();
        assert_eq!(record.mate_ref_id, record.ref_id);
        assert_eq!(record.mate_pos, 300);
        assert_eq!(record.qual.as_deref().unwrap()[0], b'I' - 33);
        assert_eq!(record.tag(*b"NM"), Some(&AuxValue::Int32(2)));

        let mut out = Vec::new();
        encode_line(&record, &dict, &mut out).unwrap();
        assert_eq!(out, line);
    }

    #[test]
    fn test_decode_unmapped_line() {
        let mut dict = dict();
        let line = b"r3\t4\t*\t0\t0\t*\t*\t0\t0\tACGT\t*";
        let record = decode_line(line, &mut dict, 0).unwrap();
        assert_eq!(record.ref_id, -1);
        assert_eq!(record.pos, -1);
        assert!(record.cigar.is_empty());
        assert!(!record.is_mapped());
    }

    #[test]
    fn test_decode_unknown_reference() {
        let mut dict = dict();
        let line = b"r1\t0\tchrZ\t101\t60\t10M\t*\t0\t0\tACGTACGTAC\t*";
        assert!(matches!(
            decode_line(line, &mut dict, 0),
            Err(SamBamError::UnknownReference { name }) if name == "chrZ"
        ));
    }

    #[test]
    fn test_decode_too_few_fields() {
        let mut dict = dict();
        assert!(matches!(
            decode_line(b"r1\t0\tchr1", &mut dict, 7),
            Err(SamBamError::MalformedRecord { ordinal: 7, .. })
        ));
    }

    #[test]
    fn test_decode_cigar_sequence_disagreement() {
        let mut dict = dict();
        let line = b"r1\t0\tchr1\t101\t60\t4M\t*\t0\t0\tACGTACGTAC\t*";
        assert!(matches!(
            decode_line(line, &mut dict, 0),
            Err(SamBamError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn test_decode_quality_length_disagreement() {
        let mut dict = dict();
        let line = b"r1\t0\tchr1\t101\t60\t4M\t*\t0\t0\tACGT\tII";
        assert!(matches!(
            decode_line(line, &mut dict, 0),
            Err(SamBamError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn test_tag_types_roundtrip() {
        let mut dict = dict();
        let line: &[u8] = b"r1\t0\tchr1\t101\t60\t4M\t*\t0\t0\tACGT\t*\tXA:A:q\tXB:B:C,1,2,255\tXF:f:2.5\tXH:H:1AFF\tXN:i:-7";
        let record = decode_line(line, &mut dict, 0).unwrap();
        assert_eq!(record.tag(*b"XA"), Some(&AuxValue::Char(b'q')));
        assert_eq!(record.tag(*b"XB"), Some(&AuxValue::Array(AuxArray::UInt8(vec![1, 2, 255]))));
        assert_eq!(record.tag(*b"XF"), Some(&AuxValue::Float(2.5)));
        assert_eq!(record.tag(*b"XH"), Some(&AuxValue::Hex(vec![0x1a, 0xff])));
        assert_eq!(record.tag(*b"XN"), Some(&AuxValue::Int32(-7)));

        let mut out = Vec::new();
        encode_line(&record, &dict, &mut out).unwrap();
        assert_eq!(out, line);
    }

    #[test]
    fn test_tag_malformed() {
        let mut dict = dict();
        for bad in [
            &b"r1\t0\tchr1\t101\t60\t4M\t*\t0\t0\tACGT\t*\tXA"[..],
            b"r1\t0\tchr1\t101\t60\t4M\t*\t0\t0\tACGT\t*\tXA:Q:1",
            b"r1\t0\tchr1\t101\t60\t4M\t*\t0\t0\tACGT\t*\tXH:H:ABC",
        ] {
            assert!(matches!(
                decode_line(bad, &mut dict, 0),
                Err(SamBamError::MalformedRecord { .. })
            ));
        }
    }
}
