use crate::{error::PoolError, pool::ConstantPool};

pub type StringId = u32;
pub type FrameId = u32;
pub type StackId = u32;

/// One raw frame as reported by a [`StackSource`](crate::source::StackSource).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Frame {
    pub class_name: String,
    pub method_name: String,
    pub line_number: i32,
}

impl Frame {
    pub fn new(
        class_name: impl Into<String>,
        method_name: impl Into<String>,
        line_number: i32,
    ) -> Self {
        Frame {
            class_name: class_name.into(),
            method_name: method_name.into(),
            line_number,
        }
    }
}

/// A frame with its names replaced by string pool indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameElement {
    pub class_name: StringId,
    pub method_name: StringId,
    pub line_number: i32,
}

/// Interned call-stack node: a frame plus the node of its caller.
///
/// The caller is already interned when a node is built, so comparing the
/// caller index is the same as comparing the whole chain down to the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameSequence {
    pub frame: FrameId,
    pub caller: Option<StackId>,
}

/// A frame resolved back to text, as returned by [`StackPools::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFrame {
    pub class_name: String,
    pub method_name: String,
    pub line_number: i32,
}

/// The three process-lifetime pools shared by every thread.
#[derive(Debug)]
pub struct StackPools {
    pub strings: ConstantPool<String>,
    pub frames: ConstantPool<FrameElement>,
    pub stacks: ConstantPool<FrameSequence>,
}

impl StackPools {
    pub fn new() -> Self {
        StackPools {
            strings: ConstantPool::new("strings"),
            frames: ConstantPool::new("frames"),
            stacks: ConstantPool::new("stacks"),
        }
    }

    pub fn intern_string(&self, s: &str) -> Result<StringId, PoolError> {
        self.strings.get_or_insert(s)
    }

    pub fn intern_frame(&self, frame: &Frame) -> Result<FrameId, PoolError> {
        let element = FrameElement {
            class_name: self.intern_string(&frame.class_name)?,
            method_name: self.intern_string(&frame.method_name)?,
            line_number: frame.line_number,
        };
        self.frames.get_or_insert(&element)
    }

    /// Interns a leaf-first stack and returns the index of its leaf node.
    ///
    /// Nodes are built from the root outwards and interned one at a time, so
    /// stacks with a common root-aligned prefix share those nodes. Empty
    /// stacks yield `None`.
    pub fn intern_stack(&self, frames: &[Frame]) -> Result<Option<StackId>, PoolError> {
        let mut caller = None;
        for frame in frames.iter().rev() {
            let node = FrameSequence {
                frame: self.intern_frame(frame)?,
                caller,
            };
            caller = Some(self.stacks.get_or_insert(&node)?);
        }
        Ok(caller)
    }

    /// Walks a stack node back to text, leaf first.
    pub fn resolve(&self, stack: StackId) -> Option<Vec<ResolvedFrame>> {
        let mut out = Vec::new();
        let mut next = Some(stack);
        while let Some(id) = next {
            let node = self.stacks.get(id)?;
            let element = self.frames.get(node.frame)?;
            out.push(ResolvedFrame {
                class_name: self.strings.get(element.class_name)?.clone(),
                method_name: self.strings.get(element.method_name)?.clone(),
                line_number: element.line_number,
            });
            next = node.caller;
        }
        Some(out)
    }
}

impl Default for StackPools {
    fn default() -> Self {
        Self::new()
    }
}
