/// A very small byte writer for the chunk format.
///
/// Integers are LEB128 varints unless written with one of the `fixed_*`
/// methods, which use little-endian fixed width.
///
/// # Example
///
/// ```ignore
/// let mut out = ByteEmitter::new();
/// out.u8(2);
/// out.varint(300);
/// out.string("run");
/// assert_eq!(out.as_bytes(), &[
///     2,          // raw byte
///     0xac, 0x02, // 300 as varint
///     3,          // length of string (in bytes)
///     114, 117, 110,
/// ]);
/// ```
#[derive(Debug, Default)]
pub struct ByteEmitter {
    data: Vec<u8>,
}

impl ByteEmitter {
    pub fn new() -> Self {
        ByteEmitter { data: Vec::new() }
    }

    pub fn u8(&mut self, data: u8) {
        self.data.push(data);
    }

    pub fn fixed_u64(&mut self, data: u64) {
        self.data.extend(data.to_le_bytes());
    }

    pub fn varint(&mut self, mut val: u64) {
        loop {
            let byte = (val & 0x7f) as u8;
            val >>= 7;
            if val > 0 {
                self.data.push(byte | 0x80);
            } else {
                self.data.push(byte);
                return;
            }
        }
    }

    /// Signed varint, zigzag-mapped so small negatives stay short.
    pub fn svarint(&mut self, val: i64) {
        self.varint(zigzag_encode(val));
    }

    pub fn string(&mut self, data: &str) {
        self.varint(data.len() as u64);
        self.data.extend(data.as_bytes());
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

pub fn zigzag_encode(val: i64) -> u64 {
    ((val << 1) ^ (val >> 63)) as u64
}

pub fn zigzag_decode(val: u64) -> i64 {
    ((val >> 1) as i64) ^ -((val & 1) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_bytes() {
        let mut out = ByteEmitter::new();
        out.varint(0);
        out.varint(127);
        out.varint(128);
        out.varint(300);
        assert_eq!(out.as_bytes(), &[0, 0x7f, 0x80, 0x01, 0xac, 0x02]);

        out.clear();
        out.varint(u64::MAX);
        assert_eq!(out.as_bytes().len(), 10);
    }

    #[test]
    fn zigzag() {
        assert_eq!(zigzag_encode(0), 0);
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
        assert_eq!(zigzag_encode(-2), 3);
        for v in [0i64, 1, -1, 42, -42, i32::MIN as i64, i64::MAX, i64::MIN] {
            assert_eq!(zigzag_decode(zigzag_encode(v)), v);
        }
    }

    #[test]
    fn string_is_length_prefixed() {
        let mut out = ByteEmitter::new();
        out.u8(2);
        out.varint(300);
        out.string("run");
        assert_eq!(out.as_bytes(), &[2, 0xac, 0x02, 3, 114, 117, 110]);
    }
}
