use std::{fmt, ptr::NonNull};

/// Divide, rounding up
///
/// Does not overflow for any `num`.
pub const fn divroundup(num: usize, divisor: usize) -> usize {
    num / divisor + (num % divisor != 0) as usize
}

/// Pointer wrapper that prints as a hex address
///
/// Used for structured `tracing` fields and for address sets in diagnostics.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UsizePtr(usize);

impl UsizePtr {
    pub fn addr(self) -> usize {
        self.0
    }
}

impl<T> From<*const T> for UsizePtr {
    fn from(value: *const T) -> Self {
        Self(value as usize)
    }
}
impl<T> From<*mut T> for UsizePtr {
    fn from(value: *mut T) -> Self {
        Self(value as usize)
    }
}
impl<T> From<NonNull<T>> for UsizePtr {
    fn from(value: NonNull<T>) -> Self {
        Self(value.as_ptr() as usize)
    }
}
impl<T> From<&T> for UsizePtr {
    fn from(value: &T) -> Self {
        Self(value as *const T as usize)
    }
}

impl fmt::Debug for UsizePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divroundup_test() {
        assert_eq!(divroundup(0, 4), 0);
        assert_eq!(divroundup(4, 4), 1);
        assert_eq!(divroundup(5, 4), 2);
        assert_eq!(divroundup(usize::MAX, 2), usize::MAX / 2 + 1);
    }

    #[test]
    fn usize_ptr_debug() {
        let p = UsizePtr::from(0x1230 as *const u8);
        assert_eq!(format!("{:?}", p), "0x1230");
        assert_eq!(p.addr(), 0x1230);
    }
}
