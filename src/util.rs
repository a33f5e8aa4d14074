//! Useful traits and other utilities that don't really belong anywhere else.

use std::io::{self, Read};

pub trait ReadExt {
    /// Read until EOF or until `limit` bytes have been read, whichever comes first, then pad the
    /// result with erased (0xFF) bytes up to a multiple of `align`.
    ///
    /// This shapes arbitrary input into whole pages, ready to program.
    fn read_aligned(&mut self, limit: usize, align: usize) -> io::Result<Vec<u8>>;
}

impl<T: Read> ReadExt for T {
    fn read_aligned(&mut self, limit: usize, align: usize) -> io::Result<Vec<u8>> {
        const CHUNK_SIZE: usize = 65536;

        let mut vec = Vec::new();
        let mut cursor = 0;
        while cursor < limit {
            vec.resize(std::cmp::min(limit, cursor + CHUNK_SIZE), 0u8);

            cursor += match self.read(&mut vec[cursor..]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
                Err(x) => return Err(x),
            };
        }
        vec.truncate(cursor);

        if align > 0 && cursor % align != 0 {
            vec.resize(cursor + align - cursor % align, 0xFF);
        }
        Ok(vec)
    }
}

#[test]
fn test_read_aligned() -> io::Result<()> {
    let vec = (&[1, 2, 3][..]).read_aligned(100, 4)?;
    assert_eq!(vec, [1, 2, 3, 0xFF]);

    let vec = io::repeat(0xAA).read_aligned(6, 4)?;
    assert_eq!(vec, [0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xFF, 0xFF]);

    let vec = io::repeat(0xBB).read_aligned(8, 4)?;
    assert_eq!(vec, [0xBB; 8]);

    assert!(io::empty().read_aligned(16, 4)?.is_empty());
    Ok(())
}
