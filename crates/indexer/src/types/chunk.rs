use std::fmt::Display;

/// Inclusive range of blocks scanned as one unit of work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Chunk {
    from: u64,
    to: u64,
}

impl Chunk {
    /// Creates a chunk; `from` must not exceed `to`.
    pub fn new(from: u64, to: u64) -> Self {
        debug_assert!(from <= to, "empty chunk {from}..={to}");
        Self { from, to }
    }

    pub fn from(&self) -> u64 { self.from }

    pub fn to(&self) -> u64 { self.to }
}

impl Display for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}..={}]", self.from, self.to)
    }
}
