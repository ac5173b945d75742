use bitflags::bitflags;

/// Version of the extension ABI implemented by this crate.
pub const ABI_VERSION: u32 = 1;

/// Symbol under which an image exports its [`ModuleMetadata`].
pub const METADATA_SYMBOL: &str = "hearth_module_metadata";

/// Raw value of [`ModuleFlags::FINI_REQUIRED`], usable in `const` contexts.
pub const FINI_REQUIRED_BIT: u32 = 0x1;

bitflags! {
    pub struct ModuleFlags: u32 {
        /// The image must export a finalizer, and loading fails if it does not.
        const FINI_REQUIRED = FINI_REQUIRED_BIT;
    }
}

/// Metadata record exported by an extension image.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModuleMetadata {
    pub abi_version: u32,
    pub flags: u32,
}

impl ModuleMetadata {
    pub const fn new(flags: u32) -> Self {
        ModuleMetadata {
            abi_version: ABI_VERSION,
            flags,
        }
    }

    /// Flags of this record. Bits unknown to this version are ignored.
    pub fn flags(&self) -> ModuleFlags {
        ModuleFlags::from_bits_truncate(self.flags)
    }

    pub fn fini_required(&self) -> bool {
        self.flags().contains(ModuleFlags::FINI_REQUIRED)
    }
}

impl Default for ModuleMetadata {
    /// The metadata assumed for images that do not export any.
    fn default() -> Self {
        ModuleMetadata::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_flag_bits_are_ignored() {
        let md = ModuleMetadata {
            abi_version: ABI_VERSION,
            flags: 0x8000_0001,
        };
        assert_eq!(md.flags(), ModuleFlags::FINI_REQUIRED);
        assert!(!ModuleMetadata::default().fini_required());
    }
}
