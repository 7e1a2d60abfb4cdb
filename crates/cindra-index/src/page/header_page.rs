//! Header page: the root-of-descent anchor for one tree.

use super::{read_u32, write_u32};

/// Byte offset of the root page number.
const ROOT_PAGE_OFFSET: usize = 0;

/// Read-only view of a tree's header page.
///
/// The header holds a single field: the page number of the current root,
/// or the sentinel when the tree is empty. Its page latch doubles as the
/// root-of-descent lock for the crabbing protocol.
pub struct HeaderPageRef<'a> {
    data: &'a [u8],
}

impl<'a> HeaderPageRef<'a> {
    /// Creates a view over header page bytes.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Returns the root page number (sentinel if the tree is empty).
    pub fn root_page_num(&self) -> u32 {
        read_u32(self.data, ROOT_PAGE_OFFSET)
    }
}

/// Mutable view of a tree's header page.
pub struct HeaderPageMut<'a> {
    data: &'a mut [u8],
}

impl<'a> HeaderPageMut<'a> {
    /// Creates a mutable view over header page bytes.
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    /// Returns the root page number.
    pub fn root_page_num(&self) -> u32 {
        read_u32(self.data, ROOT_PAGE_OFFSET)
    }

    /// Sets the root page number.
    pub fn set_root_page_num(&mut self, page_num: u32) {
        write_u32(self.data, ROOT_PAGE_OFFSET, page_num);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cindra_common::page::INVALID_PAGE_NUM;

    #[test]
    fn test_header_page_roundtrip() {
        let mut buf = [0u8; 64];

        let mut header = HeaderPageMut::new(&mut buf);
        header.set_root_page_num(42);
        assert_eq!(header.root_page_num(), 42);

        let view = HeaderPageRef::new(&buf);
        assert_eq!(view.root_page_num(), 42);
    }

    #[test]
    fn test_header_page_sentinel() {
        let mut buf = [0u8; 64];

        let mut header = HeaderPageMut::new(&mut buf);
        header.set_root_page_num(INVALID_PAGE_NUM);
        assert_eq!(HeaderPageRef::new(&buf).root_page_num(), INVALID_PAGE_NUM);
        // Stored bytes are the int32 -1 pattern
        assert_eq!(&buf[0..4], &[0xFF, 0xFF, 0xFF, 0xFF]);
    }
}
