use std::{fmt, ops};

/// A set of readiness operations.
///
/// `readable` and `writable` are the operations a registration can ask for;
/// `error` and `hup` are only ever reported by the selector and should be
/// treated as hints that the next I/O call will fail.
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
pub struct Ready(usize);

const READABLE: usize = 0b0001;
const WRITABLE: usize = 0b0010;
const ERROR: usize    = 0b0100;
const HUP: usize      = 0b1000;

impl Ready {
    #[inline]
    pub fn empty() -> Ready {
        Ready(0)
    }

    #[inline]
    pub fn readable() -> Ready {
        Ready(READABLE)
    }

    #[inline]
    pub fn writable() -> Ready {
        Ready(WRITABLE)
    }

    #[inline]
    pub fn error() -> Ready {
        Ready(ERROR)
    }

    #[inline]
    pub fn hup() -> Ready {
        Ready(HUP)
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self == Ready::empty()
    }

    #[inline]
    pub fn is_readable(self) -> bool {
        self.contains(Ready::readable())
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        self.contains(Ready::writable())
    }

    #[inline]
    pub fn is_error(self) -> bool {
        self.contains(Ready::error())
    }

    #[inline]
    pub fn is_hup(self) -> bool {
        self.contains(Ready::hup())
    }

    #[inline]
    pub fn contains(self, other: Ready) -> bool {
        (self & other) == other
    }

    #[inline]
    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    #[inline]
    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl ops::BitAnd for Ready {
    type Output = Ready;

    #[inline]
    fn bitand(self, other: Ready) -> Ready {
        Ready(self.0 & other.0)
    }
}

impl ops::Sub for Ready {
    type Output = Ready;

    #[inline]
    fn sub(self, other: Ready) -> Ready {
        Ready(self.0 & !other.0)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        let flags = [
            (Ready::readable(), "Readable"),
            (Ready::writable(), "Writable"),
            (Ready::error(), "Error"),
            (Ready::hup(), "Hup"),
        ];

        for &(flag, msg) in &flags {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", msg)?;

                one = true
            }
        }

        if !one {
            write!(fmt, "(empty)")?;
        }

        Ok(())
    }
}
