use std::{fmt, ops};

const READABLE: u8 = 0b0_0001;
const WRITABLE: u8 = 0b0_0010;
// Only ever reported, never requested.
const ERROR: u8 = 0b0_0100;
const HUP: u8 = 0b0_1000;
const READ_CLOSED: u8 = 0b1_0000;

/// The set of events a [`Channel`] wants to be told about.
///
/// Unlike readiness, interest can be *empty*: a channel that has been
/// disabled stays registered with its poller (for cheap re-arm) while asking
/// for nothing.
///
/// [`Channel`]: crate::Channel
#[derive(Copy, Clone, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Interest(u8);

impl Interest {
    /// Readable interest.
    pub const READABLE: Interest = Interest(READABLE);

    /// Writable interest.
    pub const WRITABLE: Interest = Interest(WRITABLE);

    /// No interest at all; the disabled state.
    pub const fn empty() -> Interest {
        Interest(0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn is_readable(self) -> bool {
        (self.0 & READABLE) != 0
    }

    pub const fn is_writable(self) -> bool {
        (self.0 & WRITABLE) != 0
    }

    /// Union, usable in const context.
    pub const fn add(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    /// Set difference.
    pub const fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
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
            return write!(fmt, "(empty)");
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

/// The set of events a poller reported for one file descriptor.
///
/// `readable` already folds in `POLLPRI`; `error` folds in `POLLNVAL`.
/// A peer half-close (`POLLRDHUP`) is tracked separately from a full hang-up
/// (`POLLHUP`) because dispatch treats them differently: hang-up without
/// readable data routes to the close callback, a half-close routes to the
/// read callback so buffered bytes are drained first.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Ready(u8);

impl Ready {
    pub const READABLE: Ready = Ready(READABLE);
    pub const WRITABLE: Ready = Ready(WRITABLE);
    pub const ERROR: Ready = Ready(ERROR);
    pub const HUP: Ready = Ready(HUP);
    pub const READ_CLOSED: Ready = Ready(READ_CLOSED);

    pub const fn empty() -> Ready {
        Ready(0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn is_readable(self) -> bool {
        (self.0 & READABLE) != 0
    }

    pub const fn is_writable(self) -> bool {
        (self.0 & WRITABLE) != 0
    }

    pub const fn is_error(self) -> bool {
        (self.0 & ERROR) != 0
    }

    pub const fn is_hup(self) -> bool {
        (self.0 & HUP) != 0
    }

    pub const fn is_read_closed(self) -> bool {
        (self.0 & READ_CLOSED) != 0
    }
}

impl ops::BitOr for Ready {
    type Output = Self;

    #[inline]
    fn bitor(self, other: Self) -> Self {
        Ready(self.0 | other.0)
    }
}

impl ops::BitOrAssign for Ready {
    #[inline]
    fn bitor_assign(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(fmt, "(empty)");
        }
        let mut one = false;
        for (set, name) in [
            (self.is_readable(), "READABLE"),
            (self.is_writable(), "WRITABLE"),
            (self.is_error(), "ERROR"),
            (self.is_hup(), "HUP"),
            (self.is_read_closed(), "READ_CLOSED"),
        ] {
            if set {
                if one {
                    write!(fmt, " | ")?;
                }
                write!(fmt, "{}", name)?;
                one = true;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Interest, Ready};

    #[test]
    fn interest_algebra() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.is_readable());
        assert!(both.is_writable());
        assert!(!both.is_empty());

        let read_only = both.remove(Interest::WRITABLE);
        assert!(read_only.is_readable());
        assert!(!read_only.is_writable());

        assert!(Interest::empty().is_empty());
        assert_eq!(read_only.remove(Interest::READABLE), Interest::empty());
    }

    #[test]
    fn ready_accumulates() {
        let mut ready = Ready::empty();
        ready |= Ready::READABLE;
        ready |= Ready::HUP;
        assert!(ready.is_readable());
        assert!(ready.is_hup());
        assert!(!ready.is_writable());
    }

    #[test]
    fn debug_output() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert_eq!(format!("{:?}", both), "READABLE | WRITABLE");
        assert_eq!(format!("{:?}", Interest::empty()), "(empty)");
    }
}
