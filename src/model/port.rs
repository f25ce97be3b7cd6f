use super::types::{NodeKey, PortType, TensorShape};
use crate::error::{ModelError, ModelResult};

pub const DEFAULT_INPUT_PORT: &str = "input";
pub const DEFAULT_OUTPUT_PORT: &str = "output";

/// A contiguous selection `[start, start + count)` of one node output.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PortRange {
    pub node: NodeKey,
    pub output: usize,
    pub port_type: PortType,
    pub start: usize,
    pub count: usize,
}

impl PortRange {
    pub fn end(&self) -> usize {
        self.start + self.count
    }

    /// True when `next` continues this range in the same port.
    fn is_adjacent(&self, next: &PortRange) -> bool {
        self.node == next.node && self.output == next.output && self.end() == next.start
    }
}

/// An ordered selection of ranges over one or more output ports forming a
/// single logical input.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PortElements {
    ranges: Vec<PortRange>,
    port_type: PortType,
}

impl PortElements {
    /// Selects a whole output port.
    pub fn whole(node: NodeKey, output: usize, port_type: PortType, size: usize) -> Self {
        Self {
            ranges: vec![PortRange {
                node,
                output,
                port_type,
                start: 0,
                count: size,
            }],
            port_type,
        }
    }

    /// Builds a selection from ranges; empty lists and mixed element types are rejected.
    pub fn from_ranges(ranges: Vec<PortRange>) -> ModelResult<Self> {
        let first = ranges
            .first()
            .ok_or_else(|| ModelError::InvalidArgument("empty port element list".into()))?;
        let port_type = first.port_type;
        if let Some(bad) = ranges.iter().find(|r| r.port_type != port_type) {
            return Err(ModelError::TypeMismatch {
                expected: port_type,
                found: bad.port_type,
            });
        }
        Ok(Self { ranges, port_type }.consolidated())
    }

    /// Concatenates several selections in order.
    pub fn concat(parts: &[PortElements]) -> ModelResult<Self> {
        Self::from_ranges(parts.iter().flat_map(|p| p.ranges.iter().copied()).collect())
    }

    /// Selects elements `[start, start + count)` of this selection.
    pub fn sub_range(&self, start: usize, count: usize) -> ModelResult<Self> {
        if start + count > self.size() || count == 0 {
            return Err(ModelError::OutOfRange(format!(
                "sub-range {}..{} of {} elements",
                start,
                start + count,
                self.size()
            )));
        }
        let mut ranges = Vec::new();
        let mut offset = 0;
        let end = start + count;
        for range in &self.ranges {
            let range_begin = offset;
            let range_end = offset + range.count;
            offset = range_end;
            let lo = start.max(range_begin);
            let hi = end.min(range_end);
            if lo < hi {
                ranges.push(PortRange {
                    start: range.start + (lo - range_begin),
                    count: hi - lo,
                    ..*range
                });
            }
        }
        Self::from_ranges(ranges)
    }

    /// Selects element `index`.
    pub fn element(&self, index: usize) -> ModelResult<Self> {
        self.sub_range(index, 1)
    }

    pub fn ranges(&self) -> &[PortRange] {
        &self.ranges
    }

    pub fn port_type(&self) -> PortType {
        self.port_type
    }

    pub fn size(&self) -> usize {
        self.ranges.iter().map(|r| r.count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Returns the single range when the selection is one contiguous run.
    pub fn as_single_range(&self) -> Option<&PortRange> {
        match self.ranges.as_slice() {
            [single] => Some(single),
            _ => None,
        }
    }

    /// Rewrites every range through `f`, used when ports move between models.
    pub fn map_ranges(
        &self,
        mut f: impl FnMut(&PortRange) -> ModelResult<PortElements>,
    ) -> ModelResult<Self> {
        let mut parts = Vec::with_capacity(self.ranges.len());
        for range in &self.ranges {
            parts.push(f(range)?);
        }
        Self::concat(&parts)
    }

    fn consolidated(mut self) -> Self {
        let mut merged: Vec<PortRange> = Vec::with_capacity(self.ranges.len());
        for range in self.ranges.drain(..) {
            if range.count == 0 {
                continue;
            }
            match merged.last_mut() {
                Some(last) if last.is_adjacent(&range) => last.count += range.count,
                _ => merged.push(range),
            }
        }
        self.ranges = merged;
        self
    }
}

/// An input attachment point: a name and the upstream elements it reads.
#[derive(Clone, Debug, PartialEq)]
pub struct InputPort {
    pub name: String,
    pub elements: PortElements,
}

impl InputPort {
    pub fn new(name: impl Into<String>, elements: PortElements) -> Self {
        Self {
            name: name.into(),
            elements,
        }
    }

    pub fn size(&self) -> usize {
        self.elements.size()
    }

    pub fn port_type(&self) -> PortType {
        self.elements.port_type()
    }
}

/// An output attachment point: typed, sized and optionally shaped.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputPort {
    pub name: String,
    pub port_type: PortType,
    pub size: usize,
    pub shape: Option<TensorShape>,
}

impl OutputPort {
    pub fn new(name: impl Into<String>, port_type: PortType, size: usize) -> Self {
        Self {
            name: name.into(),
            port_type,
            size,
            shape: None,
        }
    }

    pub fn with_shape(mut self, shape: TensorShape) -> Self {
        self.shape = Some(shape);
        self
    }

    pub fn shape(&self) -> TensorShape {
        self.shape.unwrap_or_else(|| TensorShape::vector(self.size))
    }
}

/// Input and output ports declared by a node.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodePorts {
    pub inputs: Vec<InputPort>,
    pub outputs: Vec<OutputPort>,
}

impl NodePorts {
    pub fn new(inputs: Vec<InputPort>, outputs: Vec<OutputPort>) -> Self {
        Self { inputs, outputs }
    }

    pub fn input(&self, name: &str) -> ModelResult<&InputPort> {
        self.inputs
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| ModelError::PortNotFound(name.to_string()))
    }

    pub fn output(&self, name: &str) -> ModelResult<&OutputPort> {
        self.outputs
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| ModelError::PortNotFound(name.to_string()))
    }

    pub fn output_index(&self, name: &str) -> ModelResult<usize> {
        self.outputs
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| ModelError::PortNotFound(name.to_string()))
    }
}

/// Either kind of port, as returned by a lookup by name.
#[derive(Debug, Clone, Copy)]
pub enum PortRef<'a> {
    Input(&'a InputPort),
    Output(&'a OutputPort),
}
