use std::time::Duration;

use crate::{
    emit::zigzag_decode,
    encoder::FormatVersion,
    error::DecodeError,
    frame::ResolvedFrame,
    registry::ThreadId,
    rle::PAYLOAD_MASK,
};

/// Most samples a single decoded chunk may expand to.
pub const MAX_DECODED_SAMPLES: usize = 1 << 26;

struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or(DecodeError::UnexpectedEof(self.pos))?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(DecodeError::UnexpectedEof(self.data.len()))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn fixed_u64(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    fn varint(&mut self) -> Result<u64, DecodeError> {
        let start = self.pos;
        let mut val = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            if shift == 63 && byte > 1 {
                return Err(DecodeError::VarintOverflow(start));
            }
            val |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(val);
            }
            shift += 7;
            if shift > 63 {
                return Err(DecodeError::VarintOverflow(start));
            }
        }
    }

    fn index(&mut self, table: &'static str, len: usize) -> Result<usize, DecodeError> {
        let index = self.varint()?;
        if index >= len as u64 {
            return Err(DecodeError::IndexOutOfRange { table, index, len });
        }
        Ok(index as usize)
    }

    fn count(&mut self) -> Result<usize, DecodeError> {
        // Every counted item takes at least one byte.
        let count = self.varint()?;
        let remaining = self.data.len() - self.pos;
        if count > remaining as u64 {
            return Err(DecodeError::UnexpectedEof(self.data.len()));
        }
        Ok(count as usize)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub class_name: u32,
    pub method_name: u32,
    pub line_number: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedStack {
    pub frame: u32,
    pub caller: Option<u32>,
}

/// A chunk read back from its binary form. Indices are chunk-local.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedChunk {
    pub version: FormatVersion,
    pub thread_id: ThreadId,
    pub thread_name: String,
    pub scope_name: String,
    pub start_epoch_nanos: u64,
    pub duration: Duration,
    pub strings: Vec<String>,
    pub frames: Vec<DecodedFrame>,
    pub stacks: Vec<DecodedStack>,
    /// Stack indices in recording order, one per sample.
    pub samples: Vec<u32>,
}

impl DecodedChunk {
    /// Frames of a chunk-local stack, leaf first.
    pub fn resolve(&self, stack: u32) -> Option<Vec<ResolvedFrame>> {
        let mut out = Vec::new();
        let mut next = Some(stack);
        while let Some(id) = next {
            let node = self.stacks.get(id as usize)?;
            let frame = self.frames.get(node.frame as usize)?;
            out.push(ResolvedFrame {
                class_name: self.strings.get(frame.class_name as usize)?.clone(),
                method_name: self.strings.get(frame.method_name as usize)?.clone(),
                line_number: frame.line_number,
            });
            next = node.caller;
        }
        Some(out)
    }

    /// Every sample resolved to its frames.
    pub fn resolved_samples(&self) -> Vec<Vec<ResolvedFrame>> {
        self.samples
            .iter()
            .filter_map(|s| self.resolve(*s))
            .collect()
    }
}

pub struct ChunkDecoder;

impl ChunkDecoder {
    pub fn decode(bytes: &[u8]) -> Result<DecodedChunk, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }
        let mut r = ByteReader { data: bytes, pos: 0 };
        let version_byte = r.u8()?;
        let version = FormatVersion::from_byte(version_byte)
            .ok_or(DecodeError::UnsupportedVersion(version_byte))?;
        let thread_id = r.fixed_u64()?;
        let start_epoch_nanos = r.fixed_u64()?;
        let duration = Duration::from_nanos(r.fixed_u64()?);

        let string_count = r.count()?;
        let mut strings = Vec::with_capacity(string_count);
        for i in 0..string_count {
            let len = r.varint()? as usize;
            let raw = r.take(len)?;
            let s = std::str::from_utf8(raw)
                .map_err(|_| DecodeError::InvalidUtf8(i))?;
            strings.push(s.to_owned());
        }
        let thread_name = strings[r.index("string", strings.len())?].clone();
        let scope_name = strings[r.index("string", strings.len())?].clone();

        let frame_count = r.count()?;
        let mut frames = Vec::with_capacity(frame_count);
        for _ in 0..frame_count {
            let class_name = r.index("string", strings.len())? as u32;
            let method_name = r.index("string", strings.len())? as u32;
            let line_number = zigzag_decode(r.varint()?) as i32;
            frames.push(DecodedFrame {
                class_name,
                method_name,
                line_number,
            });
        }

        let stack_count = r.count()?;
        let mut stacks = Vec::with_capacity(stack_count);
        for i in 0..stack_count {
            let frame = r.index("frame", frames.len())? as u32;
            // callers precede callees, so a valid caller is below `i`
            let caller = match r.index("stack", i + 1)? {
                0 => None,
                c => Some(c as u32 - 1),
            };
            stacks.push(DecodedStack { frame, caller });
        }

        let entry_count = r.count()?;
        let mut samples = Vec::new();
        match version {
            FormatVersion::Raw => {
                samples.reserve(entry_count);
                for _ in 0..entry_count {
                    samples.push(r.index("stack", stacks.len())? as u32);
                }
            }
            FormatVersion::Rle => {
                let mut last: Option<u32> = None;
                for offset in 0..entry_count {
                    let entry = r.varint()?;
                    if entry & 1 == 1 {
                        let literal = last.take().ok_or(DecodeError::MalformedLog(offset))?;
                        let repeats = entry >> 1;
                        if repeats > PAYLOAD_MASK as u64 {
                            return Err(DecodeError::MalformedLog(offset));
                        }
                        let total = samples.len() + repeats as usize;
                        if total > MAX_DECODED_SAMPLES {
                            return Err(DecodeError::TooManySamples(MAX_DECODED_SAMPLES));
                        }
                        samples.extend(std::iter::repeat(literal).take(repeats as usize));
                    } else {
                        let index = entry >> 1;
                        if index >= stacks.len() as u64 {
                            return Err(DecodeError::IndexOutOfRange {
                                table: "stack",
                                index,
                                len: stacks.len(),
                            });
                        }
                        samples.push(index as u32);
                        last = Some(index as u32);
                    }
                }
            }
        }

        let trailing = bytes.len() - r.pos;
        if trailing != 0 {
            return Err(DecodeError::TrailingBytes(trailing));
        }

        Ok(DecodedChunk {
            version,
            thread_id,
            thread_name,
            scope_name,
            start_epoch_nanos,
            duration,
            strings,
            frames,
            stacks,
            samples,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        emit::ByteEmitter,
        frame::{Frame, StackPools},
        manager::ScopeDirectory,
        ratelimit::RateLimiter,
        scope::Chunk,
    };

    fn recorded_chunk(format: FormatVersion, pattern: &[usize]) -> Chunk {
        let dir = ScopeDirectory::new(
            Arc::new(StackPools::new()),
            format,
            Arc::new(RateLimiter::new(Duration::from_secs(10))),
        );
        let pools = dir.pools().clone();
        let stacks = [
            vec![Frame::new("app.Foo", "foo", 12), Frame::new("app.Main", "main", 3)],
            vec![
                Frame::new("app.Bar", "bar", -1),
                Frame::new("app.Foo", "foo", 14),
                Frame::new("app.Main", "main", 3),
            ],
            vec![Frame::new("app.Main", "main", 4)],
        ];
        let ids: Vec<u32> = stacks
            .iter()
            .map(|s| pools.intern_stack(s).unwrap().unwrap())
            .collect();

        let m = dir.for_thread(99, "worker-1");
        let scope = m.start_scope("GET /users");
        for p in pattern {
            scope.record_sample(ids[*p]);
        }
        m.end_scope(&scope)
    }

    fn names(frames: &[ResolvedFrame]) -> Vec<&str> {
        frames.iter().map(|f| f.method_name.as_str()).collect()
    }

    #[test]
    fn decoded_chunk_matches_recording() {
        let pattern = [0, 0, 0, 1, 1, 2, 0, 2, 2, 2, 2];
        for format in [FormatVersion::Raw, FormatVersion::Rle] {
            let chunk = recorded_chunk(format, &pattern);
            let decoded = ChunkDecoder::decode(&chunk.serialize().unwrap()).unwrap();

            assert_eq!(decoded.version, format);
            assert_eq!(decoded.thread_id, 99);
            assert_eq!(decoded.thread_name, "worker-1");
            assert_eq!(decoded.scope_name, "GET /users");
            assert_eq!(decoded.start_epoch_nanos, chunk.start_epoch_nanos());
            assert_eq!(decoded.duration.as_nanos(), chunk.duration().as_nanos());
            assert_eq!(decoded.samples.len(), pattern.len());

            let expected: Vec<Vec<ResolvedFrame>> = chunk
                .samples()
                .iter()
                .map(|s| chunk.resolve(*s).unwrap())
                .collect();
            assert_eq!(decoded.resolved_samples(), expected);
            let fourth = decoded.resolve(decoded.samples[3]).unwrap();
            assert_eq!(names(&fourth), ["bar", "foo", "main"]);
            assert_eq!(fourth[0].line_number, -1);
        }
    }

    #[test]
    fn compressed_form_is_smaller() {
        let pattern = vec![1; 500];
        let raw = recorded_chunk(FormatVersion::Raw, &pattern)
            .serialize()
            .unwrap();
        let rle = recorded_chunk(FormatVersion::Rle, &pattern)
            .serialize()
            .unwrap();
        assert!(rle.len() < raw.len());
    }

    #[test]
    fn only_referenced_stacks_are_embedded() {
        let chunk = recorded_chunk(FormatVersion::Rle, &[2, 2]);
        let decoded = ChunkDecoder::decode(&chunk.serialize().unwrap()).unwrap();
        assert_eq!(decoded.stacks.len(), 1);
        assert_eq!(decoded.frames.len(), 1);
        // thread name, scope name, class, method
        assert_eq!(decoded.strings.len(), 4);
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(ChunkDecoder::decode(&[]), Err(DecodeError::Empty));
        assert_eq!(ChunkDecoder::decode(&[9, 0, 0]), Err(DecodeError::UnsupportedVersion(9)));

        let bytes = recorded_chunk(FormatVersion::Rle, &[0, 1])
            .serialize()
            .unwrap();
        for cut in [1, 10, 25, bytes.len() - 1] {
            assert!(ChunkDecoder::decode(&bytes[..cut]).is_err());
        }

        let mut longer = bytes.clone();
        longer.push(0);
        assert_eq!(ChunkDecoder::decode(&longer), Err(DecodeError::TrailingBytes(1)));
    }

    // A single sample ends in `entry count 1, literal 0`; swap that tail for
    // a literal followed by the given counter.
    fn with_counter(repeats: u64) -> Vec<u8> {
        let mut bytes = recorded_chunk(FormatVersion::Rle, &[2])
            .serialize()
            .unwrap();
        assert_eq!(bytes[bytes.len() - 2..], [1, 0]);
        bytes.truncate(bytes.len() - 2);
        let mut tail = ByteEmitter::new();
        tail.varint(2);
        tail.varint(0);
        tail.varint((repeats << 1) | 1);
        bytes.extend_from_slice(tail.as_bytes());
        bytes
    }

    #[test]
    fn rejects_oversized_counters() {
        let decoded = ChunkDecoder::decode(&with_counter(4)).unwrap();
        assert_eq!(decoded.samples, [0; 5]);

        assert_eq!(
            ChunkDecoder::decode(&with_counter(1 << 62)),
            Err(DecodeError::MalformedLog(1))
        );
        assert_eq!(
            ChunkDecoder::decode(&with_counter(PAYLOAD_MASK as u64)),
            Err(DecodeError::TooManySamples(MAX_DECODED_SAMPLES))
        );
    }
}
