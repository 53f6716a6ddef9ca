//! Interest and readiness bit sets
//!
//! `Interest` is what a channel asks the multiplexer to watch; `Readiness`
//! is what the multiplexer reports back, already translated from OS bits
//! into four logical classes:
//!
//! | Class           | Meaning                                                   |
//! |-----------------|-----------------------------------------------------------|
//! | `READABLE`      | data (or a pending connection) can be read                |
//! | `WRITABLE`      | the send buffer has room                                  |
//! | `PEER_SHUTDOWN` | readable and the peer closed or shut down its write side  |
//! | `ERROR`         | error or hangup; suppresses every other class             |

use core::fmt;
use core::ops::{BitOr, BitOrAssign};

macro_rules! bitset {
    ($name:ident { $($flag:ident = $bit:expr),* $(,)? }) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(u8);

        impl $name {
            $(pub const $flag: $name = $name($bit);)*

            #[inline]
            pub const fn empty() -> Self {
                $name(0)
            }

            #[inline]
            pub const fn bits(&self) -> u8 {
                self.0
            }

            #[inline]
            pub const fn is_empty(&self) -> bool {
                self.0 == 0
            }

            #[inline]
            pub const fn contains(&self, other: $name) -> bool {
                other.0 != 0 && self.0 & other.0 == other.0
            }

            #[inline]
            pub const fn intersects(&self, other: $name) -> bool {
                self.0 & other.0 != 0
            }

            #[inline]
            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            #[inline]
            pub fn remove(&mut self, other: $name) {
                self.0 &= !other.0;
            }
        }

        impl BitOr for $name {
            type Output = $name;
            #[inline]
            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }

        impl BitOrAssign for $name {
            #[inline]
            fn bitor_assign(&mut self, rhs: $name) {
                self.0 |= rhs.0;
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_empty() {
                    return write!(f, "{}(NONE)", stringify!($name));
                }
                write!(f, "{}(", stringify!($name))?;
                let mut first = true;
                $(
                    if self.contains($name::$flag) {
                        if !first {
                            write!(f, "|")?;
                        }
                        write!(f, "{}", stringify!($flag))?;
                        first = false;
                    }
                )*
                let _ = first;
                write!(f, ")")
            }
        }
    };
}

bitset!(Interest {
    READ = 0b01,
    WRITE = 0b10,
});

bitset!(Readiness {
    READABLE = 0b0001,
    WRITABLE = 0b0010,
    PEER_SHUTDOWN = 0b0100,
    ERROR = 0b1000,
});

impl Interest {
    pub const ALL: Interest = Interest(0b11);

    /// Readiness classes a channel with this interest may observe.
    /// Errors are always reported.
    pub fn readiness_mask(&self) -> Readiness {
        let mut mask = Readiness::ERROR;
        if self.contains(Interest::READ) {
            mask |= Readiness::READABLE | Readiness::PEER_SHUTDOWN;
        }
        if self.contains(Interest::WRITE) {
            mask |= Readiness::WRITABLE;
        }
        mask
    }
}

impl Readiness {
    /// Keep only the classes in `mask`.
    #[inline]
    pub fn retain(&mut self, mask: Readiness) {
        self.0 &= mask.0;
    }
}
