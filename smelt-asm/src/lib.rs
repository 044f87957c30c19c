use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

pub mod arm64;
pub mod x64;

use std::convert::TryInto;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Label(usize);

impl Label {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Growable little-endian byte buffer with a write position that can be
/// moved back for patching already-emitted bytes.
pub struct CodeBuffer {
    code: Vec<u8>,
    position: usize,
    labels: Vec<Option<u32>>,
}

impl CodeBuffer {
    pub fn new() -> CodeBuffer {
        CodeBuffer {
            code: Vec::new(),
            position: 0,
            labels: Vec::new(),
        }
    }

    pub fn create_label(&mut self) -> Label {
        self.labels.push(None);

        Label(self.labels.len() - 1)
    }

    pub fn create_and_bind_label(&mut self) -> Label {
        self.labels.push(Some(self.position().try_into().unwrap()));
        Label(self.labels.len() - 1)
    }

    pub fn bind_label(&mut self, lbl: Label) {
        let Label(idx) = lbl;
        assert!(self.labels[idx].is_none());
        self.labels[idx] = Some(self.position().try_into().unwrap());
    }

    pub fn bind_label_to(&mut self, lbl: Label, offset: u32) {
        let Label(idx) = lbl;
        assert!(self.labels[idx].is_none());
        self.labels[idx] = Some(offset);
    }

    pub fn offset(&self, lbl: Label) -> Option<u32> {
        let Label(idx) = lbl;
        self.labels[idx]
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn set_position(&mut self, pos: usize) {
        assert!(pos <= self.code.len());
        self.position = pos;
    }

    pub fn set_position_end(&mut self) {
        self.position = self.code.len();
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Pads with zero bytes until the end of the buffer is a multiple of
    /// `alignment`. Only valid when the position is at the end.
    pub fn align_to(&mut self, alignment: usize) {
        assert!(self.position == self.code.len());
        assert!(alignment.is_power_of_two());

        while self.code.len() % alignment != 0 {
            self.emit_u8(0);
        }
    }

    pub fn emit_u8(&mut self, value: u8) {
        if self.position == self.code.len() {
            self.code.push(value);
        } else {
            self.code[self.position] = value;
        }
        self.position += 1;
    }

    pub fn emit_u16(&mut self, value: u16) {
        if self.position == self.code.len() {
            self.code.write_u16::<LittleEndian>(value).unwrap();
        } else {
            LittleEndian::write_u16(&mut self.code[self.position..], value);
        }
        self.position += 2;
    }

    pub fn emit_u32(&mut self, value: u32) {
        if self.position == self.code.len() {
            self.code.write_u32::<LittleEndian>(value).unwrap();
        } else {
            LittleEndian::write_u32(&mut self.code[self.position..], value);
        }
        self.position += 4;
    }

    pub fn emit_u64(&mut self, value: u64) {
        if self.position == self.code.len() {
            self.code.write_u64::<LittleEndian>(value).unwrap();
        } else {
            LittleEndian::write_u64(&mut self.code[self.position..], value);
        }
        self.position += 8;
    }

    pub fn emit_u128(&mut self, value: u128) {
        self.emit_u64(value as u64);
        self.emit_u64((value >> 64) as u64);
    }

    pub fn code(self) -> Vec<u8> {
        self.code
    }

    pub fn bytes(&self) -> &[u8] {
        &self.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_patch() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0x90);
        buf.emit_u32(0xDEAD_BEEF);
        assert_eq!(buf.len(), 5);

        buf.set_position(1);
        buf.emit_u32(0x1234_5678);
        buf.set_position_end();

        assert_eq!(buf.bytes(), &[0x90, 0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn test_align_to() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(1);
        buf.align_to(8);
        assert_eq!(buf.len(), 8);
        buf.align_to(8);
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn test_labels() {
        let mut buf = CodeBuffer::new();
        let lbl = buf.create_label();
        assert_eq!(buf.offset(lbl), None);
        buf.emit_u32(0);
        buf.bind_label(lbl);
        assert_eq!(buf.offset(lbl), Some(4));
    }

    #[test]
    #[should_panic]
    fn test_bind_label_twice() {
        let mut buf = CodeBuffer::new();
        let lbl = buf.create_label();
        buf.bind_label(lbl);
        buf.bind_label(lbl);
    }
}
