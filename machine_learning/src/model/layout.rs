use std::ops::Range;

use crate::{MlErr, Result};

/// A named, shaped region of the flat parameter buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSegment {
    pub name: String,
    pub shape: Vec<usize>,
    pub range: Range<usize>,
}

impl ParamSegment {
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// Maps a flat parameter buffer into named tensors.
///
/// Every replica shares the same layout, which is what gives a gradient slot its
/// parameter identity across replicas.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamLayout {
    segments: Vec<ParamSegment>,
    size: usize,
}

impl ParamLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a new segment right after the last one.
    ///
    /// # Arguments
    /// * `name` - The unique name of the parameter.
    /// * `shape` - The tensor shape, the segment holds the product of its dimensions.
    pub fn push(mut self, name: &str, shape: &[usize]) -> Self {
        let len = shape.iter().product::<usize>();
        let range = self.size..self.size + len;
        self.size += len;

        self.segments.push(ParamSegment {
            name: name.to_string(),
            shape: shape.to_vec(),
            range,
        });

        self
    }

    /// The total amount of parameters.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn segments(&self) -> &[ParamSegment] {
        &self.segments
    }

    /// Looks a segment up by name.
    pub fn segment(&self, name: &str) -> Result<&ParamSegment> {
        self.segments
            .iter()
            .find(|seg| seg.name == name)
            .ok_or_else(|| MlErr::UnknownSegment(name.to_string()))
    }

    /// Checks that `buf` can hold exactly this layout.
    pub fn check(&self, what: &'static str, buf: &[f32]) -> Result<()> {
        if buf.len() != self.size {
            return Err(MlErr::SizeMismatch {
                what,
                got: buf.len(),
                expected: self.size,
            });
        }

        Ok(())
    }
}
