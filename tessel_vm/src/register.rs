use std::fmt;

/// One 8-byte stack slot.
///
/// The stack core never interprets the contents of argument and local
/// slots; they are whatever encoding the interpreter and the collector
/// agree on. Header slots use the encodings in [`crate::frame`].
#[repr(transparent)]
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
pub struct Register(u64);

impl Register {
    /// An empty slot. Used for "no scope", "no callee" and cleared locals.
    pub const EMPTY: Register = Register(0);
    pub const SIZE: usize = std::mem::size_of::<Register>();

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// `None` for [`Register::EMPTY`], the register otherwise.
    pub fn non_empty(self) -> Option<Self> {
        if self.is_empty() {
            None
        } else {
            Some(self)
        }
    }
}

impl From<u64> for Register {
    fn from(bits: u64) -> Self {
        Self(bits)
    }
}

impl fmt::Debug for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Register")
            .field(&format_args!("{:#018x}", self.0))
            .finish()
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_register() {
        assert!(Register::EMPTY.is_empty());
        assert_eq!(Register::EMPTY.non_empty(), None);
        assert_eq!(Register::from_bits(7).non_empty(), Some(Register::from(7)));
        assert_eq!(Register::SIZE, 8);
    }

    #[test]
    fn display_is_hex() {
        assert_eq!(Register::from_bits(0xff).to_string(), "0x00000000000000ff");
    }
}
