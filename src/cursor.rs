/// Little-endian field reader over a byte slice.
///
/// Every read is bounds-checked and returns `None` once the slice runs out,
/// so callers never reinterpret raw memory as a struct.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let bytes = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        let bytes = self.read_bytes(2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        let bytes = self.read_bytes(4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn skip(&mut self, len: usize) -> Option<()> {
        self.read_bytes(len).map(|_| ())
    }
}

pub fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn write_u32_at(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_little_endian_fields_in_order() {
        let data = [0x78, 0x56, 0x34, 0x12, 0xCD, 0xAB, 0xFF];
        let mut cursor = ByteCursor::new(&data);
        assert_eq!(cursor.read_u32(), Some(0x1234_5678));
        assert_eq!(cursor.read_u16(), Some(0xABCD));
        assert_eq!(cursor.position(), 6);
        assert_eq!(cursor.remaining(), 1);
        // not enough left for a u16, and a failed read does not advance
        assert_eq!(cursor.read_u16(), None);
        assert_eq!(cursor.position(), 6);
        assert_eq!(cursor.read_bytes(1), Some(&[0xFF][..]));
    }

    #[test]
    fn write_at_overwrites_in_place() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 1);
        put_u32(&mut buf, 2);
        write_u32_at(&mut buf, 4, 0xDEC0_DED1);
        assert_eq!(ByteCursor::new(&buf[4..]).read_u32(), Some(0xDEC0_DED1));
    }
}
