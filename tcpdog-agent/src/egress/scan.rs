//! Key-skip scan over the decoder's JSON output.
//!
//! The decoder emits keys in FieldRef order with a comma after every value,
//! so a consumer that knows the field list never needs a JSON parser: skip
//! `len(name) + 3` bytes per key (`"name":`), read the value up to the next
//! comma, and finish with the 12-byte `"Timestamp":` literal followed by ten
//! digits of Unix seconds.

const TIMESTAMP_KEY_LEN: usize = 12; // "Timestamp": including both quotes and the colon
const TIMESTAMP_DIGITS: usize = 10;

pub struct FieldScan {
    names: Vec<String>,
    lens: Vec<usize>,
}

impl FieldScan {
    pub fn new(fields: &[String]) -> Self {
        Self {
            names: fields.to_vec(),
            lens: fields.iter().map(|name| name.len() + 3).collect(),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Splits a record into per-field value slices (commas stripped) and the
    /// timestamp digits. Returns `None` when the layout does not match.
    pub fn split<'a>(&self, data: &'a [u8]) -> Option<(Vec<&'a [u8]>, &'a [u8])> {
        let mut pos = 1; // opening brace
        let mut values = Vec::with_capacity(self.lens.len());

        for len in &self.lens {
            pos += len;
            if pos > data.len() {
                return None;
            }
            let comma = data[pos..].iter().position(|b| *b == b',')? + pos;
            values.push(&data[pos..comma]);
            pos = comma + 1;
        }

        pos += TIMESTAMP_KEY_LEN;
        let end = pos + TIMESTAMP_DIGITS;
        if end > data.len() {
            return None;
        }

        Some((values, &data[pos..end]))
    }
}
