//! The value-exchange stack at the host/interpreter boundary.
//!
//! Indices are 1-based from the bottom of the current frame. A host call
//! opens a frame holding its arguments; everything below the frame base is
//! invisible until the frame is left.

use crate::error::{AccessError, StackError};
use crate::marshal::FromValue;
use crate::value::Value;

#[derive(Clone, Debug, Default)]
pub struct Stack {
    values: Vec<Value>,
    frames: Vec<usize>,
}

impl Stack {
    pub fn new() -> Self {
        Self::default()
    }

    fn base(&self) -> usize {
        self.frames.last().copied().unwrap_or(0)
    }

    /// Entries in the current frame.
    pub fn size(&self) -> usize {
        self.values.len() - self.base()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Number of open frames (0 at top level).
    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    pub fn push(&mut self, value: Value) {
        self.values.push(value);
    }

    pub fn pop(&mut self, n: usize) -> Result<(), StackError> {
        self.pop_values(n).map(drop)
    }

    /// Remove the top `n` entries and hand them back, bottom first.
    pub fn pop_values(&mut self, n: usize) -> Result<Vec<Value>, StackError> {
        let size = self.size();
        if n > size {
            return Err(StackError::Underflow { requested: n, size });
        }
        let at = self.values.len() - n;
        Ok(self.values.split_off(at))
    }

    pub fn peek(&self, index: usize) -> Result<&Value, StackError> {
        let size = self.size();
        if index == 0 || index > size {
            return Err(StackError::IndexOutOfRange { index, size });
        }
        Ok(&self.values[self.base() + index - 1])
    }

    pub fn peek_top(&self) -> Result<&Value, StackError> {
        self.peek(self.size())
    }

    /// Typed read of slot `index`.
    pub fn get<T: FromValue>(&self, index: usize) -> Result<T, AccessError> {
        Ok(T::from_value(self.peek(index)?)?)
    }

    /// Borrowed string view; valid until the next mutation of the stack.
    pub fn peek_str(&self, index: usize) -> Result<&str, AccessError> {
        Ok(self.peek(index)?.as_str()?)
    }

    pub fn peek_number(&self, index: usize) -> Result<f64, AccessError> {
        self.get(index)
    }

    pub fn peek_bool(&self, index: usize) -> Result<bool, AccessError> {
        self.get(index)
    }

    /// Shrink the current frame to `size` entries; larger sizes are ignored.
    pub fn truncate(&mut self, size: usize) {
        let base = self.base();
        self.values.truncate(base + size);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.as_slice().iter()
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.values[self.base()..]
    }

    pub fn enter_frame(&mut self) {
        self.frames.push(self.values.len());
    }

    /// Drop the current frame and everything pushed inside it. Returns false
    /// at top level, where there is no frame to leave.
    pub fn leave_frame(&mut self) -> bool {
        match self.frames.pop() {
            Some(base) => {
                self.values.truncate(base);
                true
            }
            None => false,
        }
    }
}
