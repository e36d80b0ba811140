//! buffers for use when writing and reading dns packets

use derive_more::{Display, Error, From};

/// Largest datagram the relay will receive or build
pub const MAX_PACKET_SIZE: usize = 4096;

/// Maximum length of a presentation-format domain name
pub const MAX_NAME_LEN: usize = 255;

/// Maximum length of a single label
pub const MAX_LABEL_LEN: usize = 63;

/// Upper bound on compression pointers followed while decoding one name
pub const MAX_JUMPS: usize = 16;

#[derive(Debug, Display, From, Error)]
pub enum BufferError {
    Io(std::io::Error),
    EndOfBuffer,
    BufferFull,
    TooManyJumps,
    #[display(fmt = "BadPointer({})", _0)]
    BadPointer(#[error(not(source))] usize),
    #[display(fmt = "InvalidLabelType({:#04x})", _0)]
    InvalidLabelType(#[error(not(source))] u8),
    LabelTooLong,
    NameTooLong,
    InvalidEscape,
}

type Result<T> = std::result::Result<T, BufferError>;

pub trait PacketBuffer {
    fn read(&mut self) -> Result<u8>;
    fn get(&mut self, pos: usize) -> Result<u8>;
    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]>;
    fn write(&mut self, val: u8) -> Result<()>;
    fn set(&mut self, pos: usize, val: u8) -> Result<()>;
    fn pos(&self) -> usize;
    fn seek(&mut self, pos: usize) -> Result<()>;
    fn step(&mut self, steps: usize) -> Result<()>;

    fn write_u8(&mut self, val: u8) -> Result<()> {
        self.write(val)?;

        Ok(())
    }

    fn set_u16(&mut self, pos: usize, val: u16) -> Result<()> {
        self.set(pos, (val >> 8) as u8)?;
        self.set(pos + 1, (val & 0xFF) as u8)?;

        Ok(())
    }

    fn write_u16(&mut self, val: u16) -> Result<()> {
        self.write((val >> 8) as u8)?;
        self.write((val & 0xFF) as u8)?;

        Ok(())
    }

    fn write_u32(&mut self, val: u32) -> Result<()> {
        self.write(((val >> 24) & 0xFF) as u8)?;
        self.write(((val >> 16) & 0xFF) as u8)?;
        self.write(((val >> 8) & 0xFF) as u8)?;
        self.write((val & 0xFF) as u8)?;

        Ok(())
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        for b in data {
            self.write(*b)?;
        }

        Ok(())
    }

    /// Writes `qname` as a plain label sequence. Outgoing names are never
    /// compressed.
    fn write_qname(&mut self, qname: &str) -> Result<()> {
        for label in qname_labels(qname)? {
            self.write_u8(label.len() as u8)?;
            self.write_bytes(&label)?;
        }

        self.write_u8(0)?;

        Ok(())
    }

    fn read_u16(&mut self) -> Result<u16> {
        let res = ((self.read()? as u16) << 8) | (self.read()? as u16);

        Ok(res)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let res = ((self.read()? as u32) << 24)
            | ((self.read()? as u32) << 16)
            | ((self.read()? as u32) << 8)
            | (self.read()? as u32);

        Ok(res)
    }

    /// Reads a domain name into `outstr`, following compression pointers.
    ///
    /// Label bytes outside printable ASCII, and any `.` or `\` inside a
    /// label, are written as `\DDD` so that `write_qname` restores the exact
    /// wire form.
    ///
    /// Pointers must refer strictly backwards from the position they were
    /// found at, and at most `MAX_JUMPS` of them are followed, so a crafted
    /// packet can neither loop nor recurse without bound. When a pointer was
    /// taken, the buffer position ends up just after the first pointer.
    fn read_qname(&mut self, outstr: &mut String) -> Result<()> {
        let mut pos = self.pos();
        let mut jumped = false;
        let mut jumps_performed = 0;
        let mut delim = "";
        let mut name_len = 0;

        loop {
            let len = self.get(pos)?;

            match len & 0xC0 {
                0xC0 => {
                    if jumps_performed >= MAX_JUMPS {
                        return Err(BufferError::TooManyJumps);
                    }

                    let b2 = self.get(pos + 1)? as usize;
                    let offset = (((len as usize) ^ 0xC0) << 8) | b2;
                    if offset >= pos {
                        return Err(BufferError::BadPointer(offset));
                    }

                    if !jumped {
                        self.seek(pos + 2)?;
                    }

                    pos = offset;
                    jumped = true;
                    jumps_performed += 1;
                    continue;
                }
                0x00 => {}
                _ => return Err(BufferError::InvalidLabelType(len)),
            }

            pos += 1;

            if len == 0 {
                break;
            }

            let len = len as usize;
            name_len += delim.len() + len;
            if name_len > MAX_NAME_LEN {
                return Err(BufferError::NameTooLong);
            }

            outstr.push_str(delim);
            let str_buffer = self.get_range(pos, len)?;
            escape_label(str_buffer, outstr);

            delim = ".";
            pos += len;
        }

        if !jumped {
            self.seek(pos)?;
        }

        Ok(())
    }
}

fn escape_label(label: &[u8], outstr: &mut String) {
    for &b in label {
        match b {
            0x21..=0x7E if b != b'.' && b != b'\\' => outstr.push(b as char),
            _ => outstr.push_str(&format!("\\{:03}", b)),
        }
    }
}

/// Splits a textual name into raw labels, undoing `\DDD` and `\X` escapes.
/// Empty labels, such as the one after a trailing dot, are skipped.
pub fn qname_labels(qname: &str) -> Result<Vec<Vec<u8>>> {
    let mut labels = Vec::new();
    let mut label = Vec::new();
    let mut name_len = 0;
    let mut bytes = qname.bytes();

    loop {
        let next = bytes.next();
        match next {
            Some(b'\\') => label.push(unescape(&mut bytes)?),
            Some(b'.') | None => {
                if !label.is_empty() {
                    if label.len() > MAX_LABEL_LEN {
                        return Err(BufferError::LabelTooLong);
                    }

                    name_len += label.len() + if labels.is_empty() { 0 } else { 1 };
                    if name_len > MAX_NAME_LEN {
                        return Err(BufferError::NameTooLong);
                    }

                    labels.push(std::mem::take(&mut label));
                }

                if next.is_none() {
                    break;
                }
            }
            Some(b) => label.push(b),
        }
    }

    Ok(labels)
}

fn unescape<I: Iterator<Item = u8>>(bytes: &mut I) -> Result<u8> {
    let first = bytes.next().ok_or(BufferError::InvalidEscape)?;
    if !first.is_ascii_digit() {
        return Ok(first);
    }

    let mut value = (first - b'0') as u32;
    for _ in 0..2 {
        match bytes.next() {
            Some(d) if d.is_ascii_digit() => value = value * 10 + (d - b'0') as u32,
            _ => return Err(BufferError::InvalidEscape),
        }
    }

    if value > 0xFF {
        return Err(BufferError::InvalidEscape);
    }

    Ok(value as u8)
}

/// A growable buffer used when assembling outgoing packets
#[derive(Default)]
pub struct VectorPacketBuffer {
    pub buffer: Vec<u8>,
    pub pos: usize,
    pub max_size: usize,
}

impl VectorPacketBuffer {
    pub fn new() -> VectorPacketBuffer {
        VectorPacketBuffer::with_max_size(MAX_PACKET_SIZE)
    }

    pub fn with_max_size(max_size: usize) -> VectorPacketBuffer {
        VectorPacketBuffer {
            buffer: Vec::new(),
            pos: 0,
            max_size,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

impl PacketBuffer for VectorPacketBuffer {
    fn read(&mut self) -> Result<u8> {
        let res = *self.buffer.get(self.pos).ok_or(BufferError::EndOfBuffer)?;
        self.pos += 1;

        Ok(res)
    }

    fn get(&mut self, pos: usize) -> Result<u8> {
        self.buffer.get(pos).copied().ok_or(BufferError::EndOfBuffer)
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        self.buffer
            .get(start..start + len)
            .ok_or(BufferError::EndOfBuffer)
    }

    fn write(&mut self, val: u8) -> Result<()> {
        if self.pos >= self.max_size {
            return Err(BufferError::BufferFull);
        }

        if self.pos == self.buffer.len() {
            self.buffer.push(val);
        } else {
            self.buffer[self.pos] = val;
        }
        self.pos += 1;

        Ok(())
    }

    fn set(&mut self, pos: usize, val: u8) -> Result<()> {
        match self.buffer.get_mut(pos) {
            Some(b) => {
                *b = val;
                Ok(())
            }
            None => Err(BufferError::EndOfBuffer),
        }
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        self.pos = pos;

        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        self.pos += steps;

        Ok(())
    }
}

/// A fixed size buffer holding one received datagram
///
/// `len` marks how much of `buf` was actually filled by the socket. Reads
/// past it fail with `EndOfBuffer`, which is how truncated packets are
/// detected.
pub struct BytePacketBuffer {
    pub buf: [u8; MAX_PACKET_SIZE],
    pub pos: usize,
    pub len: usize,
}

impl Default for BytePacketBuffer {
    fn default() -> Self {
        BytePacketBuffer::new()
    }
}

impl BytePacketBuffer {
    /// This gives us a fresh buffer for holding the packet contents, and a field for
    /// keeping track of where we are.
    pub fn new() -> BytePacketBuffer {
        BytePacketBuffer {
            buf: [0; MAX_PACKET_SIZE],
            pos: 0,
            len: 0,
        }
    }

    /// Copies `data` into a fresh buffer. Anything beyond `MAX_PACKET_SIZE`
    /// is cut off, and will surface as `EndOfBuffer` if a field reaches it.
    pub fn from_bytes(data: &[u8]) -> BytePacketBuffer {
        let mut buffer = BytePacketBuffer::new();
        let len = data.len().min(MAX_PACKET_SIZE);
        buffer.buf[..len].copy_from_slice(&data[..len]);
        buffer.len = len;

        buffer
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl PacketBuffer for BytePacketBuffer {
    fn read(&mut self) -> Result<u8> {
        if self.pos >= self.len {
            return Err(BufferError::EndOfBuffer);
        }
        let res = self.buf[self.pos];
        self.pos += 1;

        Ok(res)
    }

    fn get(&mut self, pos: usize) -> Result<u8> {
        if pos >= self.len {
            return Err(BufferError::EndOfBuffer);
        }
        Ok(self.buf[pos])
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        if start + len > self.len {
            return Err(BufferError::EndOfBuffer);
        }
        Ok(&self.buf[start..start + len])
    }

    fn write(&mut self, val: u8) -> Result<()> {
        if self.pos >= MAX_PACKET_SIZE {
            return Err(BufferError::BufferFull);
        }
        self.buf[self.pos] = val;
        self.pos += 1;
        if self.pos > self.len {
            self.len = self.pos;
        }

        Ok(())
    }

    fn set(&mut self, pos: usize, val: u8) -> Result<()> {
        if pos >= MAX_PACKET_SIZE {
            return Err(BufferError::BufferFull);
        }
        self.buf[pos] = val;

        Ok(())
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        self.pos = pos;

        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        self.pos += steps;

        Ok(())
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_qname() {
        let mut buffer = VectorPacketBuffer::new();

        let instr1 = "a.google.com".to_string();
        let instr2 = "b.google.com".to_string();

        buffer.write_qname(&instr1).unwrap();
        buffer.write_qname(&instr2).unwrap();

        // Both names are written in full
        assert_eq!(28, buffer.pos());

        buffer.seek(0).unwrap();

        let mut outstr1 = String::new();
        buffer.read_qname(&mut outstr1).unwrap();
        assert_eq!(instr1, outstr1);

        let mut outstr2 = String::new();
        buffer.read_qname(&mut outstr2).unwrap();
        assert_eq!(instr2, outstr2);

        assert_eq!(buffer.pos, buffer.buffer.len());
    }

    #[test]
    fn test_pointer_resumes_after_pointer() {
        let mut data = Vec::new();
        data.extend_from_slice(&[7, b'e', b'x', b'a', b'm', b'p', b'l', b'e']);
        data.extend_from_slice(&[3, b'c', b'o', b'm', 0]);
        // "www" + pointer to offset 0
        data.extend_from_slice(&[3, b'w', b'w', b'w', 0xC0, 0x00]);
        data.push(0xAB);

        let mut buffer = BytePacketBuffer::from_bytes(&data);
        buffer.seek(13).unwrap();

        let mut name = String::new();
        buffer.read_qname(&mut name).unwrap();

        assert_eq!("www.example.com", name);
        assert_eq!(19, buffer.pos());
        assert_eq!(0xAB, buffer.read().unwrap());
    }

    #[test]
    fn test_self_pointer_is_rejected() {
        let data = [0xC0, 0x00];
        let mut buffer = BytePacketBuffer::from_bytes(&data);

        let mut name = String::new();
        match buffer.read_qname(&mut name) {
            Err(BufferError::BadPointer(0)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_forward_pointer_is_rejected() {
        let data = [0xC0, 0x04, 0x00, 0x00, 0x01, b'a', 0x00];
        let mut buffer = BytePacketBuffer::from_bytes(&data);

        let mut name = String::new();
        assert!(buffer.read_qname(&mut name).is_err());
    }

    #[test]
    fn test_pointer_chain_is_bounded() {
        // Every pointer refers to the previous one, MAX_JUMPS + 1 deep
        let mut data = vec![0u8];
        for i in 0..(MAX_JUMPS + 1) {
            let target = if i == 0 { 0 } else { 1 + (i - 1) * 2 };
            data.push(0xC0 | ((target >> 8) as u8));
            data.push((target & 0xFF) as u8);
        }
        let last = data.len() - 2;

        let mut buffer = BytePacketBuffer::from_bytes(&data);
        buffer.seek(last).unwrap();

        let mut name = String::new();
        match buffer.read_qname(&mut name) {
            Err(BufferError::TooManyJumps) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_truncated_label() {
        let data = [5, b'a', b'b'];
        let mut buffer = BytePacketBuffer::from_bytes(&data);

        let mut name = String::new();
        match buffer.read_qname(&mut name) {
            Err(BufferError::EndOfBuffer) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_reserved_label_type() {
        let data = [0x40, 0x00];
        let mut buffer = BytePacketBuffer::from_bytes(&data);

        let mut name = String::new();
        assert!(buffer.read_qname(&mut name).is_err());
    }

    #[test]
    fn test_write_rejects_long_label() {
        let mut buffer = VectorPacketBuffer::new();
        let label = "a".repeat(64);

        match buffer.write_qname(&label) {
            Err(BufferError::LabelTooLong) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_odd_label_bytes_survive() {
        let wire = [
            2, 0xFF, b'x', 4, b'a', b'.', b'b', b'\\', 2, b'h', b' ', 3, b'c', b'o', b'm', 0,
        ];
        let mut buffer = BytePacketBuffer::from_bytes(&wire);

        let mut name = String::new();
        buffer.read_qname(&mut name).unwrap();
        assert_eq!("\\255x.a\\046b\\092.h\\032.com", name);

        let mut out = VectorPacketBuffer::new();
        out.write_qname(&name).unwrap();
        assert_eq!(&wire[..], &out.buffer[..]);
    }

    #[test]
    fn test_qname_escapes() {
        assert_eq!(
            vec![b"a.b".to_vec(), b"c".to_vec()],
            qname_labels("a\\.b.c.").unwrap()
        );

        for bad in ["trailing\\", "short\\25", "big\\256"].iter() {
            match qname_labels(bad) {
                Err(BufferError::InvalidEscape) => {}
                other => panic!("unexpected result for {}: {:?}", bad, other),
            }
        }
    }

    #[test]
    fn test_vector_buffer_respects_max_size() {
        let mut buffer = VectorPacketBuffer::with_max_size(3);
        buffer.write_u16(0xABCD).unwrap();
        assert!(buffer.write_u16(0x1234).is_err());
    }

    #[test]
    fn test_integers_are_big_endian() {
        let mut buffer = VectorPacketBuffer::new();
        buffer.write_u16(0x1234).unwrap();
        buffer.write_u32(0xDEADBEEF).unwrap();

        assert_eq!(vec![0x12, 0x34, 0xDE, 0xAD, 0xBE, 0xEF], buffer.buffer);

        buffer.seek(0).unwrap();
        assert_eq!(0x1234, buffer.read_u16().unwrap());
        assert_eq!(0xDEADBEEF, buffer.read_u32().unwrap());
    }
}
