//! Backing storage for an open image: a memory map when the kernel
//! grants one, positioned reads otherwise
//!
//! Both paths sit behind the same `read_exact_at` call so tests can
//! exercise the buffered fallback without inducing real mmap failures.

use memmap::{Mmap, MmapOptions};
use std::{
    fs::File,
    io,
    os::unix::fs::FileExt,
};

#[derive(Debug)]
pub struct Backing {
    file: File,
    map: Option<Mmap>,
}

impl Backing {
    /// Map the file if possible, falling back to buffered positioned reads
    pub fn map_or_buffer(file: File) -> Backing {
        let map = match unsafe { MmapOptions::new().map(&file) } {
            Ok(map) => Some(map),
            Err(err) => {
                log::debug!("mmap failed, using buffered reads: {}", err);
                None
            }
        };
        Backing { file, map }
    }

    /// Force the buffered path, used by tests and after in-place mutation
    pub fn buffered(file: File) -> Backing {
        Backing { file, map: None }
    }

    pub fn is_mapped(&self) -> bool {
        self.map.is_some()
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Borrow a byte range directly from the map, if one is live and the
    /// range lies inside it
    pub fn slice(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let map = self.map.as_ref()?;
        let end = offset.checked_add(len)?;
        if end <= map.len() {
            Some(&map[offset..end])
        } else {
            None
        }
    }

    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        if let Some(slice) = self.slice(offset as usize, buf.len()) {
            buf.copy_from_slice(slice);
            return Ok(());
        }
        self.file.read_exact_at(buf, offset)
    }

    /// Refresh the map after the file was written or resized. A file too
    /// small to map (for example truncated to empty) quietly drops to the
    /// buffered path.
    pub fn remap(&mut self) {
        if self.map.is_some() {
            self.map = unsafe { MmapOptions::new().map(&self.file) }.ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(content: &[u8]) -> File {
        let path = std::env::temp_dir().join(format!(
            "sifbox-backing-{}-{:x}.tmp",
            std::process::id(),
            rand::random::<u64>()
        ));
        let mut f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .unwrap();
        f.write_all(content).unwrap();
        std::fs::remove_file(&path).unwrap();
        f
    }

    #[test]
    fn mapped_and_buffered_agree() {
        let content = b"0123456789abcdef";
        let mapped = Backing::map_or_buffer(temp_file(content));
        let buffered = Backing::buffered(temp_file(content));
        assert!(!buffered.is_mapped());

        for backing in [&mapped, &buffered] {
            let mut buf = [0u8; 4];
            backing.read_exact_at(&mut buf, 10).unwrap();
            assert_eq!(&buf, b"abcd");
        }
    }

    #[test]
    fn read_past_end_fails() {
        let backing = Backing::buffered(temp_file(b"short"));
        let mut buf = [0u8; 16];
        assert!(backing.read_exact_at(&mut buf, 2).is_err());
    }
}
