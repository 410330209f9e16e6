// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The ATAG list builder, grounded verbatim on
//! `libsel4vm/sel4-arm-vmm/src/images/atags.c`'s `atags_new`/
//! `atags_add_mem`/`atags_append_cmdline`. Pure: builds an in-memory byte
//! sequence that the caller writes into guest RAM at whatever IPA it
//! chooses, with no process-wide state of its own.

const ATAG_CORE: u32 = 0x5441_0001;
const ATAG_MEM: u32 = 0x5441_0002;
const ATAG_CMDLINE: u32 = 0x5441_0009;
const ATAG_NONE: u32 = 0;

const CMDLINE_SEPARATOR: &str = ", ";

enum Tag {
    Core,
    Mem { size: u32, start: u32 },
    Cmdline(String),
}

/// A singly-linked sequence of tags, opening with `CORE` and terminated
/// with an implicit zero-size `NONE` sentinel on serialization.
pub struct AtagList {
    tags: Vec<Tag>,
}

impl Default for AtagList {
    fn default() -> Self {
        Self::new()
    }
}

impl AtagList {
    /// `atags_new`: opens the list with a `CORE` tag.
    pub fn new() -> Self {
        AtagList { tags: vec![Tag::Core] }
    }

    /// `atags_add_mem`: append a `MEM` tag describing one RAM region.
    pub fn add_mem(&mut self, size: u32, start: u32) -> &mut Self {
        self.tags.push(Tag::Mem { size, start });
        self
    }

    /// `atags_append_cmdline`: append a `CMDLINE` tag. Calling this more
    /// than once joins every prior `CMDLINE` tag's text with `", "`
    /// (matching the original's extend-in-place behavior) rather than
    /// emitting a second tag.
    pub fn append_cmdline(&mut self, arg: &str) -> &mut Self {
        if let Some(Tag::Cmdline(existing)) = self.tags.iter_mut().find(|t| matches!(t, Tag::Cmdline(_))) {
            if let Tag::Cmdline(s) = existing {
                s.push_str(CMDLINE_SEPARATOR);
                s.push_str(arg);
            }
            return self;
        }
        self.tags.push(Tag::Cmdline(arg.to_string()));
        self
    }

    /// Total size in bytes of the serialized list, ATAG `NONE` sentinel
    /// included.
    pub fn size_bytes(&self) -> usize {
        self.to_bytes().len()
    }

    /// Serialize to the wire format: each tag is
    /// `{u32 size_in_words, u32 tag_id, u32[size-2] payload}`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for tag in &self.tags {
            match tag {
                Tag::Core => {
                    push_header(&mut out, 2, ATAG_CORE);
                }
                Tag::Mem { size, start } => {
                    push_header(&mut out, 4, ATAG_MEM);
                    out.extend_from_slice(&size.to_le_bytes());
                    out.extend_from_slice(&start.to_le_bytes());
                }
                Tag::Cmdline(s) => {
                    let cstr_len = s.len() + 1;
                    let words = cstr_len.div_ceil(4);
                    push_header(&mut out, (2 + words) as u32, ATAG_CMDLINE);
                    out.extend_from_slice(s.as_bytes());
                    out.push(0);
                    while out.len() % 4 != 0 {
                        out.push(0);
                    }
                }
            }
        }
        // Implicit NONE sentinel of size 0: {size=0, tag=0}.
        push_header(&mut out, 0, ATAG_NONE);
        out
    }
}

fn push_header(out: &mut Vec<u8>, size_words: u32, tag_id: u32) {
    out.extend_from_slice(&size_words.to_le_bytes());
    out.extend_from_slice(&tag_id.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_tag_opens_every_list() {
        let atags = AtagList::new();
        let bytes = atags.to_bytes();
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 2);
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), ATAG_CORE);
    }

    #[test]
    fn mem_tag_carries_size_and_start() {
        let mut atags = AtagList::new();
        atags.add_mem(0x4000_0000, 0x1000_0000);
        let bytes = atags.to_bytes();
        // CORE (8 bytes) then MEM header+payload.
        let mem_off = 8;
        assert_eq!(u32::from_le_bytes(bytes[mem_off..mem_off + 4].try_into().unwrap()), 4);
        assert_eq!(u32::from_le_bytes(bytes[mem_off + 8..mem_off + 12].try_into().unwrap()), 0x4000_0000);
        assert_eq!(u32::from_le_bytes(bytes[mem_off + 12..mem_off + 16].try_into().unwrap()), 0x1000_0000);
    }

    #[test]
    fn repeated_cmdline_appends_are_joined_with_comma_space() {
        let mut atags = AtagList::new();
        atags.append_cmdline("console=ttyAMA0");
        atags.append_cmdline("root=/dev/vda");
        match atags.tags.iter().find(|t| matches!(t, Tag::Cmdline(_))).unwrap() {
            Tag::Cmdline(s) => assert_eq!(s, "console=ttyAMA0, root=/dev/vda"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn list_terminates_with_zero_size_none_sentinel() {
        let atags = AtagList::new();
        let bytes = atags.to_bytes();
        let last8 = &bytes[bytes.len() - 8..];
        assert_eq!(u32::from_le_bytes(last8[0..4].try_into().unwrap()), 0);
        assert_eq!(u32::from_le_bytes(last8[4..8].try_into().unwrap()), ATAG_NONE);
    }

    #[test]
    fn size_bytes_matches_to_bytes_length() {
        let mut atags = AtagList::new();
        atags.add_mem(1, 2).append_cmdline("panic=1");
        assert_eq!(atags.size_bytes(), atags.to_bytes().len());
    }
}
