use std::ops::Bound;

use crate::session::KeyRange;

/// Builds composite row keys.
///
/// Text is length-prefixed so a prefix made of whole components only ever
/// matches keys with exactly those components. Integers are big-endian so
/// byte order equals numeric order.
#[derive(Debug, Default, Clone)]
pub struct KeyBuilder(Vec<u8>);

impl KeyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, s: &str) -> Self {
        self.0.extend_from_slice(&(s.len() as u32).to_be_bytes());
        self.0.extend_from_slice(s.as_bytes());
        self
    }

    pub fn u64(mut self, v: u64) -> Self {
        self.0.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn byte(mut self, b: u8) -> Self {
        self.0.push(b);
        self
    }

    pub fn bytes(mut self, b: &[u8]) -> Self {
        self.0.extend_from_slice(b);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.0
    }
}

/// Reads back the components written by [`KeyBuilder`], front to back.
pub struct KeyReader<'a> {
    buf: &'a [u8],
}

impl<'a> KeyReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.buf.len() < n {
            return None;
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Some(head)
    }

    pub fn text(&mut self) -> Option<&'a str> {
        let len = u32::from_be_bytes(self.take(4)?.try_into().ok()?) as usize;
        std::str::from_utf8(self.take(len)?).ok()
    }

    pub fn u64(&mut self) -> Option<u64> {
        Some(u64::from_be_bytes(self.take(8)?.try_into().ok()?))
    }
}

/// Every key starting with `prefix`.
pub fn prefix_range(prefix: Vec<u8>) -> KeyRange {
    let upper = prefix_successor(&prefix).map_or(Bound::Unbounded, Bound::Excluded);
    (Bound::Included(prefix), upper)
}

/// Keys under `prefix` whose next component is a big-endian u64 in `[lo, hi]`.
pub fn u64_range(prefix: &[u8], lo: u64, hi: u64) -> KeyRange {
    let lower = KeyBuilder::new().bytes(prefix).u64(lo).build();
    let upper = match hi.checked_add(1) {
        Some(next) => Bound::Excluded(KeyBuilder::new().bytes(prefix).u64(next).build()),
        None => prefix_successor(prefix).map_or(Bound::Unbounded, Bound::Excluded),
    };
    (Bound::Included(lower), upper)
}

pub fn full_range() -> KeyRange {
    (Bound::Unbounded, Bound::Unbounded)
}

/// Smallest key greater than every key starting with `prefix`.
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.pop() {
        if last < u8::MAX {
            out.push(last + 1);
            return Some(out);
        }
    }
    None
}
