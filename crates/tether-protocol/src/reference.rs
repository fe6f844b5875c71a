//! Message reference generation.

/// Largest reference value before the counter wraps.
///
/// Peers written in JavaScript parse references into doubles, so the counter
/// stays within the exactly representable integer range.
pub const MAX_REF: u64 = (1 << 53) - 1;

/// Monotonic reference counter.
///
/// Yields `"1"`, `"2"`, ... and wraps to `"0"` after [`MAX_REF`].
#[derive(Debug, Clone, Default)]
pub struct RefCounter {
    current: u64,
}

impl RefCounter {
    /// Create a counter whose first reference is `"1"`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a counter positioned at `current`.
    #[must_use]
    pub fn starting_at(current: u64) -> Self {
        Self { current }
    }

    /// Produce the next reference.
    pub fn next_ref(&mut self) -> String {
        self.current = if self.current >= MAX_REF {
            0
        } else {
            self.current + 1
        };
        self.current.to_string()
    }

    /// The last reference handed out.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.current
    }
}
