use std::{fmt, ops};

/// Readiness interest of a handler.
///
/// A set over readable and writable interest. Unlike a registration-only
/// API the empty set is representable: a handler whose interest drops to
/// [`Interest::NONE`] stays known to its poller but is withdrawn from the
/// kernel interest list until it is re-enabled.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Interest(u8);

// These must be unique.
const READABLE: u8 = 0b01;
const WRITABLE: u8 = 0b10;

impl Interest {
    /// The empty interest set.
    pub const NONE: Interest = Interest(0);

    /// Readable interest.
    pub const READABLE: Interest = Interest(READABLE);

    /// Writable interest.
    pub const WRITABLE: Interest = Interest(WRITABLE);

    /// Add together two `Interest`s.
    #[allow(clippy::should_implement_trait)]
    pub const fn add(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    /// Remove `other` from `self`.
    pub const fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    /// Returns true if the value includes readable interest.
    pub const fn is_readable(self) -> bool {
        (self.0 & READABLE) != 0
    }

    /// Returns true if the value includes writable interest.
    pub const fn is_writable(self) -> bool {
        (self.0 & WRITABLE) != 0
    }

    /// Returns true if no interest is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub(crate) const fn bits(self) -> u8 {
        self.0
    }

    pub(crate) const fn from_bits(bits: u8) -> Interest {
        Interest(bits)
    }
}

impl ops::BitOr for Interest {
    type Output = Self;

    #[inline]
    fn bitor(self, other: Self) -> Self {
        self.add(other)
    }
}

impl ops::BitOrAssign for Interest {
    #[inline]
    fn bitor_assign(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(fmt, "NONE");
        }
        let mut one = false;
        if self.is_readable() {
            write!(fmt, "READABLE")?;
            one = true;
        }
        if self.is_writable() {
            if one {
                write!(fmt, " | ")?;
            }
            write!(fmt, "WRITABLE")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Interest;

    #[test]
    fn add_remove() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.is_readable());
        assert!(both.is_writable());

        let read = both.remove(Interest::WRITABLE);
        assert!(read.is_readable());
        assert!(!read.is_writable());

        assert!(read.remove(Interest::READABLE).is_empty());
    }

    #[test]
    fn debug_format() {
        assert_eq!(format!("{:?}", Interest::NONE), "NONE");
        assert_eq!(
            format!("{:?}", Interest::READABLE | Interest::WRITABLE),
            "READABLE | WRITABLE"
        );
    }
}
