use std::fmt;
use std::os::raw::c_int;

/// Prefix of the exported symbol naming each ordinal entry point.
pub const ORDINAL_SYMBOL_PREFIX: &str = "hearth_ordinal_";

/// Signature of the entry point at [`Ordinal::INIT`].
pub type InitFn = unsafe extern "C" fn();

/// Signature of the entry point at [`Ordinal::FINI`]. Zero means success.
pub type FiniFn = unsafe extern "C" fn() -> c_int;

/// Position of an entry point in an extension image's export table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ordinal(pub u32);

impl Ordinal {
    pub const INIT: Ordinal = Ordinal(1);
    pub const FINI: Ordinal = Ordinal(2);

    /// The symbol an image exports for this ordinal.
    pub fn symbol_name(self) -> String {
        format!("{}{}", ORDINAL_SYMBOL_PREFIX, self.0)
    }
}

impl fmt::Display for Ordinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_names() {
        assert_eq!(Ordinal::INIT.symbol_name(), "hearth_ordinal_1");
        assert_eq!(Ordinal::FINI.symbol_name(), "hearth_ordinal_2");
        assert_eq!(Ordinal::FINI.to_string(), "#2");
    }
}
