//! Table-driven bit field access over hex payloads.
//!
//! Every packet family is described by a [`Layout`]: a fixed hex header plus a list of
//! [`Field`] descriptors addressed by absolute bit offset from the start of the payload
//! (bit 0 is the most significant bit of the first hex character). A single pair of
//! routines, [`read_bits`] and [`write_bits`], serves both decoding of received payloads
//! and encoding of the synthetic packets the virtual bridge emits, so a layout that
//! decodes a family also re-encodes it bit for bit.
//!
//! Reads never panic: a field that runs past the end of the payload, or covers a
//! non-hex character, yields `None`.

/// One named bit range inside a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    /// Absolute bit offset from the start of the payload.
    pub bit: usize,
    /// Width in bits, at most 64.
    pub width: u8,
}

pub const fn field(name: &'static str, bit: usize, width: u8) -> Field {
    Field { name, bit, width }
}

/// A packet family's header and field table.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub name: &'static str,
    /// Fixed leading hex characters written by [`Layout::encode`]. Empty for decode-only layouts.
    pub header: &'static str,
    pub fields: &'static [Field],
    /// Total payload size in bits; encoded payloads are zero padded to this length.
    pub total_bits: usize,
}

/// Decoded field values, in layout order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldValues(Vec<(&'static str, u64)>);

impl FieldValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &'static str, value: u64) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &'static str, value: u64) {
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.0.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(&'static str, u64)> {
        self.0.iter()
    }
}

fn nibble(c: u8) -> Option<u8> {
    (c as char).to_digit(16).map(|d| d as u8)
}

fn hex_char(n: u8) -> char {
    char::from_digit(u32::from(n & 0x0F), 16)
        .unwrap_or('0')
        .to_ascii_uppercase()
}

/// Read `width` bits starting at absolute bit `bit` of a hex string.
pub fn read_bits(hex: &str, bit: usize, width: u8) -> Option<u64> {
    if width == 0 || width > 64 {
        return None;
    }
    let bytes = hex.as_bytes();
    let end = bit + width as usize;
    if end > bytes.len() * 4 {
        return None;
    }
    let mut value: u64 = 0;
    let mut cached: Option<(usize, u8)> = None;
    for pos in bit..end {
        let idx = pos / 4;
        let n = match cached {
            Some((i, n)) if i == idx => n,
            _ => {
                let n = nibble(bytes[idx])?;
                cached = Some((idx, n));
                n
            }
        };
        let b = (n >> (3 - (pos % 4))) & 1;
        value = (value << 1) | u64::from(b);
    }
    Some(value)
}

/// Write the low `width` bits of `value` at absolute bit `bit` into a nibble buffer.
pub fn write_bits(nibbles: &mut [u8], bit: usize, width: u8, value: u64) {
    for i in 0..width as usize {
        let pos = bit + i;
        let idx = pos / 4;
        if idx >= nibbles.len() {
            return;
        }
        let b = ((value >> (width as usize - 1 - i)) & 1) as u8;
        let shift = 3 - (pos % 4);
        nibbles[idx] = (nibbles[idx] & !(1 << shift)) | (b << shift);
    }
}

/// Parse a hex string into a nibble buffer. Returns `None` on any non-hex character.
pub fn to_nibbles(hex: &str) -> Option<Vec<u8>> {
    hex.bytes().map(nibble).collect()
}

/// Render a nibble buffer as uppercase hex.
pub fn from_nibbles(nibbles: &[u8]) -> String {
    nibbles.iter().map(|n| hex_char(*n)).collect()
}

/// Format a 48-bit value as a 12 character uppercase MAC without separators.
pub fn mac_string(value: u64) -> String {
    format!("{:012X}", value & 0xFFFF_FFFF_FFFF)
}

/// Parse a MAC with or without `:` separators into a 48-bit value.
pub fn parse_mac(mac: &str) -> Option<u64> {
    let compact: String = mac.chars().filter(|c| *c != ':').collect();
    if compact.len() != 12 {
        return None;
    }
    u64::from_str_radix(&compact, 16).ok()
}

impl Layout {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Read a single named field.
    pub fn get(&self, hex: &str, name: &str) -> Option<u64> {
        let f = self.field(name)?;
        read_bits(hex, f.bit, f.width)
    }

    /// Read a named 48-bit field as a MAC string.
    pub fn get_mac(&self, hex: &str, name: &str) -> Option<String> {
        self.get(hex, name).map(mac_string)
    }

    /// Decode every field. Fails if any field is out of range.
    pub fn decode(&self, hex: &str) -> Option<FieldValues> {
        let mut out = FieldValues::new();
        for f in self.fields {
            out.set(f.name, read_bits(hex, f.bit, f.width)?);
        }
        Some(out)
    }

    /// Encode values into a fresh payload: header, fields, zero padding.
    /// Fields missing from `values` are written as zero.
    pub fn encode(&self, values: &FieldValues) -> String {
        let mut nibbles = vec![0u8; self.total_bits.div_ceil(4)];
        for (i, c) in self.header.bytes().enumerate() {
            if let (Some(slot), Some(n)) = (nibbles.get_mut(i), nibble(c)) {
                *slot = n;
            }
        }
        for f in self.fields {
            write_bits(&mut nibbles, f.bit, f.width, values.get(f.name).unwrap_or(0));
        }
        from_nibbles(&nibbles)
    }

    /// Overwrite fields in an existing payload, leaving every other bit as is.
    pub fn patch(&self, hex: &str, values: &FieldValues) -> Option<String> {
        let mut nibbles = to_nibbles(hex)?;
        for (name, value) in values.iter() {
            let f = self.field(name)?;
            write_bits(&mut nibbles, f.bit, f.width, *value);
        }
        Some(from_nibbles(&nibbles))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_unaligned_bits() {
        // 0xA5 = 1010_0101
        assert_eq!(read_bits("A5", 0, 8), Some(0xA5));
        assert_eq!(read_bits("A5", 1, 3), Some(0b010));
        assert_eq!(read_bits("A5", 3, 2), Some(0b00));
        assert_eq!(read_bits("A5", 6, 2), Some(0b01));
        assert_eq!(read_bits("A5", 4, 8), None);
        assert_eq!(read_bits("Z5", 0, 4), None);
    }

    #[test]
    fn write_then_read_is_stable() {
        let mut n = vec![0u8; 6];
        write_bits(&mut n, 3, 13, 0x1ABC);
        assert_eq!(read_bits(&from_nibbles(&n), 3, 13), Some(0x1ABC));
        write_bits(&mut n, 0, 3, 0b101);
        assert_eq!(read_bits(&from_nibbles(&n), 3, 13), Some(0x1ABC));
    }

    #[test]
    fn mac_helpers() {
        assert_eq!(parse_mac("AE:EF:89:53:20:C1"), Some(0xAEEF895320C1));
        assert_eq!(mac_string(0xAEEF895320C1), "AEEF895320C1");
        assert_eq!(parse_mac("short"), None);
    }
}
