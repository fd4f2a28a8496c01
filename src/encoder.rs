//! Binary chunk encoding.
//!
//! ```text
//! u8        format version
//! u64 LE    thread id
//! u64 LE    start, nanoseconds since the UNIX epoch
//! u64 LE    duration in nanoseconds
//! varint    string count, then per string: varint length + UTF-8 bytes
//! varint    thread name (string index)
//! varint    scope name (string index)
//! varint    frame count, then per frame: class, method (string indices),
//!           zigzag line number
//! varint    stack count, then per stack: frame index, caller index + 1
//!           (0 for a root frame); callers always come first
//! varint    entry count, then entries
//! ```
//!
//! Version 1 entries are plain stack indices, one per sample. Version 2
//! entries are the RLE log: `index << 1` for a literal, `count << 1 | 1` for
//! a repeat counter. Pools are embedded per chunk and only hold what the
//! chunk references, renumbered densely in order of first use.

use std::collections::HashMap;

use crate::{
    emit::ByteEmitter,
    error::EncodeError,
    frame::{FrameId, StackId, StackPools},
    rle::{COUNTER_FLAG, PAYLOAD_MASK},
    scope::Chunk,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FormatVersion {
    /// Decompressed stack pointer stream.
    Raw,
    /// Run-length encoded stream.
    #[default]
    Rle,
}

impl FormatVersion {
    pub fn byte(self) -> u8 {
        match self {
            FormatVersion::Raw => 1,
            FormatVersion::Rle => 2,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(FormatVersion::Raw),
            2 => Some(FormatVersion::Rle),
            _ => None,
        }
    }
}

#[derive(Default)]
struct LocalTables<'a> {
    strings: Vec<&'a str>,
    string_ids: HashMap<&'a str, u32>,
    frames: Vec<(u32, u32, i32)>,
    frame_ids: HashMap<FrameId, u32>,
    stacks: Vec<(u32, Option<u32>)>,
    stack_ids: HashMap<StackId, u32>,
}

impl<'a> LocalTables<'a> {
    fn string(&mut self, s: &'a str) -> u32 {
        if let Some(id) = self.string_ids.get(s) {
            return *id;
        }
        let id = self.strings.len() as u32;
        self.strings.push(s);
        self.string_ids.insert(s, id);
        id
    }

    fn frame(&mut self, pools: &'a StackPools, frame: FrameId) -> Result<u32, EncodeError> {
        if let Some(id) = self.frame_ids.get(&frame) {
            return Ok(*id);
        }
        let element = pools
            .frames
            .get(frame)
            .ok_or(EncodeError::UnknownFrame(frame))?;
        let class = pools
            .strings
            .get(element.class_name)
            .ok_or(EncodeError::UnknownString(element.class_name))?;
        let method = pools
            .strings
            .get(element.method_name)
            .ok_or(EncodeError::UnknownString(element.method_name))?;
        let entry = (self.string(class), self.string(method), element.line_number);
        let id = self.frames.len() as u32;
        self.frames.push(entry);
        self.frame_ids.insert(frame, id);
        Ok(id)
    }

    fn stack(&mut self, pools: &'a StackPools, stack: StackId) -> Result<u32, EncodeError> {
        if let Some(id) = self.stack_ids.get(&stack) {
            return Ok(*id);
        }
        // Collect the unseen part of the chain, leaf first, then number it
        // from the root side so every caller precedes its callees.
        let mut pending = Vec::new();
        let mut next = Some(stack);
        let mut caller_local = None;
        while let Some(id) = next {
            if let Some(local) = self.stack_ids.get(&id) {
                caller_local = Some(*local);
                break;
            }
            let node = pools.stacks.get(id).ok_or(EncodeError::UnknownStack(id))?;
            pending.push((id, node.frame));
            next = node.caller;
        }
        for (id, frame) in pending.into_iter().rev() {
            let frame_local = self.frame(pools, frame)?;
            let local = self.stacks.len() as u32;
            self.stacks.push((frame_local, caller_local));
            self.stack_ids.insert(id, local);
            caller_local = Some(local);
        }
        // `caller_local` now names the leaf node
        caller_local.ok_or(EncodeError::UnknownStack(stack))
    }
}

pub struct ChunkEncoder {
    format: FormatVersion,
}

impl ChunkEncoder {
    pub fn new(format: FormatVersion) -> Self {
        ChunkEncoder { format }
    }

    pub fn encode(&self, chunk: &Chunk) -> Result<Vec<u8>, EncodeError> {
        let log = chunk.log();
        log.validate()?;
        let pools = chunk.pools();

        let mut tables = LocalTables::default();
        let thread_name = tables.string(chunk.thread_name());
        let scope_name = tables.string(chunk.scope_name());

        let mut entries: Vec<u64> = Vec::with_capacity(log.len());
        match self.format {
            FormatVersion::Raw => {
                for (stack, count) in log.runs() {
                    let local = tables.stack(pools, stack)? as u64;
                    entries.extend(std::iter::repeat(local).take(count as usize));
                }
            }
            FormatVersion::Rle => {
                for word in log.words() {
                    if word & COUNTER_FLAG != 0 {
                        entries.push((((word & PAYLOAD_MASK) as u64) << 1) | 1);
                    } else {
                        entries.push((tables.stack(pools, *word)? as u64) << 1);
                    }
                }
            }
        }

        let mut out = ByteEmitter::new();
        out.u8(self.format.byte());
        out.fixed_u64(chunk.thread_id());
        out.fixed_u64(chunk.start_epoch_nanos());
        out.fixed_u64(chunk.duration().as_nanos() as u64);

        out.varint(tables.strings.len() as u64);
        for s in &tables.strings {
            out.string(s);
        }
        out.varint(thread_name as u64);
        out.varint(scope_name as u64);

        out.varint(tables.frames.len() as u64);
        for (class, method, line) in &tables.frames {
            out.varint(*class as u64);
            out.varint(*method as u64);
            out.svarint(*line as i64);
        }

        out.varint(tables.stacks.len() as u64);
        for (frame, caller) in &tables.stacks {
            out.varint(*frame as u64);
            out.varint(caller.map_or(0, |c| c as u64 + 1));
        }

        out.varint(entries.len() as u64);
        for entry in entries {
            out.varint(entry);
        }

        tracing::trace!(
            thread_id = chunk.thread_id(),
            scope = chunk.scope_name(),
            bytes = out.as_bytes().len(),
            "chunk encoded"
        );
        Ok(out.into_bytes())
    }
}
