//! Byte pattern search over memory images.
//!
//! Patterns may contain wildcards. The longest fixed run is located with
//! memchr's SIMD `memmem` finder, then the full pattern is verified.

use std::fmt;

/// A byte pattern where masked-out positions match anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPattern {
    bytes: Vec<u8>,
    mask: Vec<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternError(pub String);

impl fmt::Display for PatternError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for PatternError {}

impl SearchPattern {
    /// Every byte must match.
    pub fn literal(bytes: &[u8]) -> Self {
        SearchPattern {
            bytes: bytes.to_vec(),
            mask: vec![true; bytes.len()],
        }
    }

    /// A 32-bit value as stored in memory (little-endian), e.g. a pointer.
    pub fn address(value: u32) -> Self {
        Self::literal(&value.to_le_bytes())
    }

    /// Hex bytes, either contiguous (`"ff000a20"`) or space separated
    /// (`"ff 00 ?? 20"`). `??` is a wildcard byte.
    pub fn parse_hex(text: &str) -> Result<Self, PatternError> {
        let compact: String = text.split_whitespace().collect();
        if compact.is_empty() || compact.len() % 2 != 0 {
            return Err(PatternError(format!(
                "hex pattern '{}' must have an even, non-zero number of digits",
                text
            )));
        }

        let mut bytes = Vec::with_capacity(compact.len() / 2);
        let mut mask = Vec::with_capacity(compact.len() / 2);
        for pair in compact.as_bytes().chunks(2) {
            if pair == b"??" {
                bytes.push(0);
                mask.push(false);
                continue;
            }
            let digits = std::str::from_utf8(pair).map_err(|e| PatternError(e.to_string()))?;
            let byte = u8::from_str_radix(digits, 16)
                .map_err(|_| PatternError(format!("invalid hex byte '{}'", digits)))?;
            bytes.push(byte);
            mask.push(true);
        }

        if !mask.iter().any(|m| *m) {
            return Err(PatternError("pattern consists only of wildcards".to_string()));
        }
        Ok(SearchPattern { bytes, mask })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Non-wildcard bytes, used for highlighting hexdumps.
    pub fn fixed_bytes(&self) -> Vec<u8> {
        self.bytes
            .iter()
            .zip(&self.mask)
            .filter(|(_, m)| **m)
            .map(|(b, _)| *b)
            .collect()
    }

    /// Longest contiguous run of fixed bytes: (offset, bytes).
    fn anchor(&self) -> (usize, &[u8]) {
        let mut best = (0, 0);
        let mut run_start = 0;
        let mut run_len = 0;

        for (i, fixed) in self.mask.iter().enumerate() {
            if *fixed {
                if run_len == 0 {
                    run_start = i;
                }
                run_len += 1;
                if run_len > best.1 {
                    best = (run_start, run_len);
                }
            } else {
                run_len = 0;
            }
        }

        (best.0, &self.bytes[best.0..best.0 + best.1])
    }

    fn matches_at(&self, data: &[u8]) -> bool {
        data.len() >= self.bytes.len()
            && self
                .bytes
                .iter()
                .zip(&self.mask)
                .zip(data)
                .all(|((b, fixed), d)| !fixed || b == d)
    }

    /// Offsets of every match in `data`, in ascending order.
    pub fn find_all(&self, data: &[u8]) -> Vec<usize> {
        if self.bytes.is_empty() {
            return Vec::new();
        }

        let (anchor_offset, anchor) = self.anchor();
        let finder = memchr::memmem::Finder::new(anchor);

        finder
            .find_iter(data)
            .filter_map(|hit| hit.checked_sub(anchor_offset))
            .filter(|start| start + self.bytes.len() <= data.len())
            .filter(|start| self.matches_at(&data[*start..]))
            .collect()
    }
}
