use smallvec::SmallVec;

/// Value stack of a flattened closure program, sized up front from the
/// program's high-water mark.
pub struct Stack {
    storage: SmallVec<[f64; 16]>,
}

impl Stack {
    pub fn with_capacity(capacity: usize) -> Self {
        Stack {
            storage: SmallVec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, value: f64) {
        self.storage.push(value);
    }

    pub fn pop(&mut self) -> f64 {
        self.storage
            .pop()
            .expect("Program shouldn't underflow the Stack")
    }

    /// The `count` topmost values, oldest first.
    pub fn top(&self, count: usize) -> &[f64] {
        &self.storage[self.storage.len() - count..]
    }

    pub fn discard(&mut self, count: usize) {
        self.storage.truncate(self.storage.len() - count);
    }
}
