use modular_bitfield::prelude::*;

/// Method argument descriptor, bit-packed into the 25-bit `Ax` field of an
/// `ENTER` instruction: required (5) | optional (5) | rest (1) |
/// post-required (5) | keyword-count (5) | keyword-dict (1) | block (1).
#[bitfield(bits = 25)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, BitfieldSpecifier)]
pub struct Aspec {
    pub required: B5,
    pub optional: B5,
    pub rest: bool,
    pub post: B5,
    pub keyword: B5,
    pub keyword_dict: bool,
    pub block: bool,
    #[skip]
    reserved: B2,
}

impl Aspec {
    pub fn to_ax(self) -> u32 {
        u32::from_le_bytes(self.into_bytes().try_into().unwrap_or([0; 4])) & 0x01FF_FFFF
    }

    pub fn from_ax(ax: u32) -> Self {
        Aspec::from_bytes((ax & 0x01FF_FFFF).to_le_bytes())
    }
}

/// 12-bit derivative of `Aspec` used by `SUPER`/`ARGARY`/`BLKPUSH` to
/// recover a call frame's `argv` without needing the full descriptor.
#[bitfield(bits = 12)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ainfo {
    pub required: B4,
    pub optional: B4,
    pub rest: bool,
    pub post: B3,
}

impl Ainfo {
    pub fn from_aspec(aspec: Aspec) -> Self {
        Ainfo::new()
            .with_required(aspec.required().min(0xF))
            .with_optional(aspec.optional().min(0xF))
            .with_rest(aspec.rest())
            .with_post(aspec.post().min(0x7))
    }

    pub fn to_ax(self) -> u32 {
        let bytes = self.into_bytes();
        u32::from(bytes[0]) | (u32::from(bytes[1]) << 8)
    }

    /// Packs this descriptor together with a destination register into a
    /// single 25-bit `Ax` field: register in the low 9 bits, `Ainfo` bits
    /// shifted above it. `BLKPUSH`/`ARGARY` need both a destination and the
    /// packed arity word but only have one operand slot to carry them in.
    pub fn pack_with_dest(self, dest: u16) -> u32 {
        (dest as u32 & 0x1FF) | (self.to_ax() << 9)
    }
}
