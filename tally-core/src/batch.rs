use crate::message::MessageUnit;

/// Units buffered by a single worker between flushes.
#[derive(Debug)]
pub struct Batch {
    units: Vec<MessageUnit>,
    capacity: usize,
}

impl Batch {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            units: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a unit, returning true once the batch is due for a flush.
    pub fn push(&mut self, unit: MessageUnit) -> bool {
        self.units.push(unit);
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.units.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Hands the buffered units over for a flush, leaving the batch empty.
    pub fn take(&mut self) -> Vec<MessageUnit> {
        std::mem::replace(&mut self.units, Vec::with_capacity(self.capacity))
    }
}
