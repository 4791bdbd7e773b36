//! H.264 NAL unit types and Annex-B stream scanning
//!
//! Provides:
//! - NAL unit type identification and keyframe detection
//! - A stateful scanner that splits the encoder's raw Annex-B byte stream
//!   into individual NAL units, re-framed with a canonical 4-byte start code

use bytes::{Bytes, BytesMut};

/// Maximum size of a single buffered NAL unit (128 KiB).
///
/// Bytes past this limit are dropped; the scanner re-synchronizes on the
/// next start code.
pub const MAX_NAL_SIZE: usize = 128 * 1024;

/// Canonical Annex-B start code emitted in front of every NAL unit.
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// NAL unit types (5 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    /// Non-IDR slice (P or B frame)
    SliceNonIdr,
    /// Slice data partition A
    SliceDataPartA,
    /// Slice data partition B
    SliceDataPartB,
    /// Slice data partition C
    SliceDataPartC,
    /// IDR slice (keyframe)
    SliceIdr,
    /// Supplemental enhancement information
    Sei,
    /// Sequence parameter set
    Sps,
    /// Picture parameter set
    Pps,
    /// Access unit delimiter
    Aud,
    /// End of sequence
    EndSeq,
    /// End of stream
    EndStream,
    /// Filler data
    Filler,
    /// Unknown/reserved
    Unknown(u8),
}

impl From<u8> for NalUnitType {
    fn from(value: u8) -> Self {
        match value & 0x1F {
            1 => NalUnitType::SliceNonIdr,
            2 => NalUnitType::SliceDataPartA,
            3 => NalUnitType::SliceDataPartB,
            4 => NalUnitType::SliceDataPartC,
            5 => NalUnitType::SliceIdr,
            6 => NalUnitType::Sei,
            7 => NalUnitType::Sps,
            8 => NalUnitType::Pps,
            9 => NalUnitType::Aud,
            10 => NalUnitType::EndSeq,
            11 => NalUnitType::EndStream,
            12 => NalUnitType::Filler,
            n => NalUnitType::Unknown(n),
        }
    }
}

impl NalUnitType {
    /// The raw 5-bit type value.
    pub fn as_u8(self) -> u8 {
        match self {
            NalUnitType::SliceNonIdr => 1,
            NalUnitType::SliceDataPartA => 2,
            NalUnitType::SliceDataPartB => 3,
            NalUnitType::SliceDataPartC => 4,
            NalUnitType::SliceIdr => 5,
            NalUnitType::Sei => 6,
            NalUnitType::Sps => 7,
            NalUnitType::Pps => 8,
            NalUnitType::Aud => 9,
            NalUnitType::EndSeq => 10,
            NalUnitType::EndStream => 11,
            NalUnitType::Filler => 12,
            NalUnitType::Unknown(n) => n,
        }
    }

    /// Check if this NAL unit type indicates a keyframe
    pub fn is_keyframe(&self) -> bool {
        matches!(self, NalUnitType::SliceIdr)
    }

    /// Check if this is a parameter set (SPS/PPS)
    pub fn is_parameter_set(&self) -> bool {
        matches!(self, NalUnitType::Sps | NalUnitType::Pps)
    }

    /// Check if this is a slice carrying picture data (P or IDR)
    pub fn is_slice(&self) -> bool {
        matches!(self, NalUnitType::SliceNonIdr | NalUnitType::SliceIdr)
    }
}

/// One complete NAL unit ready for the ring buffer.
///
/// `data` always begins with the canonical 4-byte start code, so the NAL
/// header byte sits at `data[4]`.
#[derive(Debug, Clone)]
pub struct NalRecord {
    /// Start code plus NAL payload
    pub data: Bytes,
    /// Type extracted from the header byte
    pub nal_type: NalUnitType,
    /// Monotonic milliseconds at the moment the scanner closed this NAL
    pub timestamp_ms: u64,
    /// Slice-boundary hint, set for P and IDR slices
    pub is_start_nal: bool,
    /// Slice-boundary hint, set for P and IDR slices
    pub is_end_nal: bool,
}

impl NalRecord {
    /// Build a record from scanner output (start code + header + payload).
    ///
    /// Returns `None` for anything shorter than a start code plus the NAL
    /// header byte.
    pub fn from_annexb(data: Bytes, timestamp_ms: u64) -> Option<Self> {
        if data.len() <= START_CODE.len() {
            return None;
        }
        let nal_type = NalUnitType::from(data[START_CODE.len()]);
        let is_slice = nal_type.is_slice();
        Some(Self {
            data,
            nal_type,
            timestamp_ms,
            is_start_nal: is_slice,
            is_end_nal: is_slice,
        })
    }

    /// Length in bytes, including the start code.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Return the length of the start code beginning at `chunk[i]`, if any.
///
/// Matching is chunk-local: a start code is only recognized when at least
/// one byte follows it in the same chunk, so a code straddling two reads is
/// not detected. The encoder writes in large bursts, which keeps this case
/// rare in practice.
fn start_code_at(chunk: &[u8], i: usize) -> Option<usize> {
    if i + 3 >= chunk.len() {
        return None;
    }
    if chunk[i] != 0x00 || chunk[i + 1] != 0x00 {
        return None;
    }
    if chunk[i + 2] == 0x01 {
        return Some(3);
    }
    if i + 4 < chunk.len() && chunk[i + 2] == 0x00 && chunk[i + 3] == 0x01 {
        return Some(4);
    }
    None
}

/// Splits an Annex-B byte stream into NAL units.
///
/// Accepts arbitrary-length chunks and accumulates the in-progress NAL
/// between calls. Both 3-byte and 4-byte start codes are recognized on
/// input; every emitted NAL begins with the canonical 4-byte form.
pub struct AnnexBScanner {
    acc: BytesMut,
    in_nal: bool,
}

impl AnnexBScanner {
    pub fn new() -> Self {
        Self {
            acc: BytesMut::with_capacity(MAX_NAL_SIZE),
            in_nal: false,
        }
    }

    /// Feed one chunk, returning every NAL unit completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < chunk.len() {
            if let Some(code_len) = start_code_at(chunk, i) {
                if self.in_nal && self.acc.len() > START_CODE.len() {
                    out.push(self.acc.split().freeze());
                } else {
                    self.acc.clear();
                }
                self.acc.extend_from_slice(&START_CODE);
                self.in_nal = true;
                i += code_len;
                continue;
            }
            // Bytes past MAX_NAL_SIZE are dropped; the oversize NAL is
            // truncated and the next start code re-synchronizes.
            if self.in_nal && self.acc.len() < MAX_NAL_SIZE {
                self.acc.extend_from_slice(&chunk[i..i + 1]);
            }
            i += 1;
        }
        out
    }

    /// Emit the in-progress NAL at end of stream, if it holds any payload.
    pub fn flush(&mut self) -> Option<Bytes> {
        let complete = self.in_nal && self.acc.len() > START_CODE.len();
        self.in_nal = false;
        if complete {
            Some(self.acc.split().freeze())
        } else {
            self.acc.clear();
            None
        }
    }

    /// Discard all scanner state.
    pub fn reset(&mut self) {
        self.acc.clear();
        self.in_nal = false;
    }
}

impl Default for AnnexBScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Check if a raw H.264 chunk contains a keyframe (without full parsing)
///
/// This is a quick heuristic check that looks for IDR NAL units.
pub fn contains_keyframe(data: &[u8]) -> bool {
    for i in 0..data.len().saturating_sub(4) {
        let is_start_code = (data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1)
            || (data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 0 && data[i + 3] == 1);

        if is_start_code {
            let nal_offset = if data[i + 2] == 1 { i + 3 } else { i + 4 };
            if nal_offset < data.len() && data[nal_offset] & 0x1F == 5 {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nal_type_parsing() {
        assert_eq!(NalUnitType::from(0x65), NalUnitType::SliceIdr);
        assert_eq!(NalUnitType::from(0x67), NalUnitType::Sps);
        assert_eq!(NalUnitType::from(0x68), NalUnitType::Pps);
        assert_eq!(NalUnitType::from(0x41), NalUnitType::SliceNonIdr);
        assert_eq!(NalUnitType::from(0x1F), NalUnitType::Unknown(31));
    }

    #[test]
    fn nal_type_round_trips_raw_value() {
        for raw in 0u8..32 {
            assert_eq!(NalUnitType::from(raw).as_u8(), raw);
        }
    }

    #[test]
    fn keyframe_detection() {
        assert!(NalUnitType::SliceIdr.is_keyframe());
        assert!(!NalUnitType::SliceNonIdr.is_keyframe());
        assert!(!NalUnitType::Sps.is_keyframe());
    }

    #[test]
    fn scanner_splits_mixed_start_codes() {
        // SPS and PPS with 4-byte codes, IDR with a 3-byte code, then a
        // P slice. The 3-byte form must be canonicalized to 4 bytes.
        let data = [
            0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1E, // SPS
            0x00, 0x00, 0x00, 0x01, 0x68, 0xCE, 0x38, 0x80, // PPS
            0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x00, 0xFF, // IDR (3-byte code)
            0x00, 0x00, 0x00, 0x01, 0x41, 0x9A, 0x00, 0x00, // P slice
        ];

        let mut scanner = AnnexBScanner::new();
        let mut nals = scanner.feed(&data);
        if let Some(last) = scanner.flush() {
            nals.push(last);
        }

        let types: Vec<u8> = nals.iter().map(|n| n[4] & 0x1F).collect();
        assert_eq!(types, vec![7, 8, 5, 1]);
        for nal in &nals {
            assert_eq!(&nal[..4], &START_CODE);
        }
        // The IDR arrived with a 3-byte code but leaves with 4.
        assert_eq!(&nals[2][..], &[0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x00, 0xFF]);
    }

    #[test]
    fn scanner_accumulates_across_chunks() {
        let mut scanner = AnnexBScanner::new();
        assert!(scanner.feed(&[0x00, 0x00, 0x00, 0x01, 0x67, 0x42]).is_empty());
        assert!(scanner.feed(&[0x11, 0x22, 0x33]).is_empty());
        let nals = scanner.feed(&[0x00, 0x00, 0x00, 0x01, 0x41, 0x9A, 0x00]);
        assert_eq!(nals.len(), 1);
        assert_eq!(
            &nals[0][..],
            &[0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x11, 0x22, 0x33]
        );
    }

    #[test]
    fn scanner_ignores_bytes_before_first_start_code() {
        let mut scanner = AnnexBScanner::new();
        let nals = scanner.feed(&[0xAA, 0xBB, 0x00, 0x00, 0x00, 0x01, 0x67, 0x42]);
        assert!(nals.is_empty());
        let last = scanner.flush().unwrap();
        assert_eq!(&last[..], &[0x00, 0x00, 0x00, 0x01, 0x67, 0x42]);
    }

    #[test]
    fn scanner_truncates_oversize_nal() {
        let mut scanner = AnnexBScanner::new();
        scanner.feed(&[0x00, 0x00, 0x00, 0x01, 0x65]);
        // Push well past the limit; the accumulator must cap out.
        let filler = vec![0xAB; MAX_NAL_SIZE];
        scanner.feed(&filler);
        let nals = scanner.feed(&[0x00, 0x00, 0x00, 0x01, 0x41, 0x9A, 0x00]);
        assert_eq!(nals.len(), 1);
        assert_eq!(nals[0].len(), MAX_NAL_SIZE);
        // Re-synchronized: the next NAL is intact.
        let last = scanner.flush().unwrap();
        assert_eq!(&last[..], &[0x00, 0x00, 0x00, 0x01, 0x41, 0x9A, 0x00]);
    }

    #[test]
    fn scanner_skips_empty_nal_between_start_codes() {
        // Two back-to-back start codes: the first opens a NAL that never
        // receives a payload byte, so nothing is emitted for it.
        let mut scanner = AnnexBScanner::new();
        let nals = scanner.feed(&[0x00, 0x00, 0x01, 0x00, 0x00, 0x01, 0x65, 0x88]);
        assert!(nals.is_empty());
        let last = scanner.flush().unwrap();
        assert_eq!(&last[..], &[0x00, 0x00, 0x00, 0x01, 0x65, 0x88]);
    }

    #[test]
    fn scanner_reset_drops_partial_nal() {
        let mut scanner = AnnexBScanner::new();
        scanner.feed(&[0x00, 0x00, 0x00, 0x01, 0x65, 0x88]);
        scanner.reset();
        assert!(scanner.flush().is_none());
    }

    #[test]
    fn record_from_annexb_extracts_metadata() {
        let idr = Bytes::from_static(&[0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84]);
        let record = NalRecord::from_annexb(idr, 1234).unwrap();
        assert_eq!(record.nal_type, NalUnitType::SliceIdr);
        assert_eq!(record.timestamp_ms, 1234);
        assert_eq!(record.size(), 7);
        assert!(record.is_start_nal);
        assert!(record.is_end_nal);

        let sps = Bytes::from_static(&[0x00, 0x00, 0x00, 0x01, 0x67, 0x42]);
        let record = NalRecord::from_annexb(sps, 0).unwrap();
        assert_eq!(record.nal_type, NalUnitType::Sps);
        assert!(!record.is_start_nal);
        assert!(!record.is_end_nal);
    }

    #[test]
    fn record_boundary_flags_match_slice_types() {
        for raw in 1u8..=12 {
            let data = Bytes::from(vec![0x00, 0x00, 0x00, 0x01, raw, 0xAA]);
            let record = NalRecord::from_annexb(data, 0).unwrap();
            let expect = raw == 1 || raw == 5;
            assert_eq!(record.is_start_nal, expect, "type {raw}");
            assert_eq!(record.is_end_nal, record.is_start_nal, "type {raw}");
        }
    }

    #[test]
    fn record_rejects_header_only_input() {
        assert!(NalRecord::from_annexb(Bytes::from_static(&START_CODE), 0).is_none());
        assert!(NalRecord::from_annexb(Bytes::new(), 0).is_none());
    }

    #[test]
    fn contains_keyframe_finds_idr() {
        let idr_data = [0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84];
        assert!(contains_keyframe(&idr_data));

        let p_data = [0x00, 0x00, 0x00, 0x01, 0x41, 0x9A, 0x24];
        assert!(!contains_keyframe(&p_data));

        let sps_data = [0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00];
        assert!(!contains_keyframe(&sps_data));
    }
}
