use std::fmt;
use std::ops::Add;

/// An address in the global address space.
///
/// The address `0` is reserved and represents the null pointer. Pointers are
/// plain integers, they carry no provenance and can be sent freely between
/// tasks and workers.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct GlobalPtr(pub(crate) u64);

impl GlobalPtr {
    pub const NULL: GlobalPtr = GlobalPtr(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn addr(&self) -> u64 {
        self.0
    }

    pub(crate) fn wrapping_add(self, offset: usize) -> GlobalPtr {
        GlobalPtr(self.0.wrapping_add(offset as u64))
    }

    /// Returns the distance in bytes from `origin` to `self`, or `None` if
    /// `origin` is above `self`.
    pub fn offset_from(&self, origin: GlobalPtr) -> Option<usize> {
        self.0
            .checked_sub(origin.0)
            .and_then(|d| usize::try_from(d).ok())
    }
}

impl Add<usize> for GlobalPtr {
    type Output = GlobalPtr;

    fn add(self, rhs: usize) -> GlobalPtr {
        GlobalPtr(self.0 + rhs as u64)
    }
}

/// A contiguous range of global memory: `len` bytes starting at `ptr`.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct GasVector {
    pub ptr: GlobalPtr,
    pub len: usize,
}

impl GasVector {
    pub fn new(ptr: GlobalPtr, len: usize) -> Self {
        Self { ptr, len }
    }

    /// `rows` ranges of `row_len` bytes, the first at `ptr` and each next one
    /// `stride` bytes further, as given by `[rows, row_len]`.
    pub fn strided(ptr: GlobalPtr, stride: usize, [rows, row_len]: [usize; 2]) -> Vec<GasVector> {
        (0..rows)
            .map(|row| GasVector::new(ptr.wrapping_add(stride.wrapping_mul(row)), row_len))
            .collect()
    }
}

impl fmt::Display for GlobalPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_from() {
        let base = GlobalPtr(0x1000);
        assert_eq!((base + 24).offset_from(base), Some(24));
        assert_eq!(base.offset_from(base + 1), None);
        assert!(GlobalPtr::NULL.is_null());
        assert_eq!(format!("{}", base), "0x1000");
    }

    #[test]
    fn test_strided_vectors() {
        let base = GlobalPtr(0x1000);
        let rows = GasVector::strided(base, 64, [3, 16]);

        assert_eq!(
            rows,
            vec![
                GasVector::new(base, 16),
                GasVector::new(base + 64, 16),
                GasVector::new(base + 128, 16),
            ]
        );
        assert!(GasVector::strided(base, 64, [0, 16]).is_empty());
    }
}
