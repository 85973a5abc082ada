use crate::error::{RhiError, RhiResult};

#[inline]
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Check that `[offset, offset + len)` fits in `size`.
pub(crate) fn check_range(what: &'static str, offset: u64, len: u64, size: u64) -> RhiResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(RhiError::OutOfRange {
            what,
            requested: offset.saturating_add(len),
            available: size,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligns_to_power_of_two() {
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert!(check_range("buffer", 250, 6, 256).is_ok());
        assert!(check_range("buffer", 250, 7, 256).is_err());
    }
}
