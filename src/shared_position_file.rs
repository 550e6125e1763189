use positioned_io::{RandomAccessFile, ReadAt};
use std::io;

/// Positioned writes through a shared reference, so the single archive
/// writer can backpatch reserved regions (chunk tables, the header) without
/// a seek cursor.
pub trait SharedWriteAt: Send + Sync {
    fn write_all_at(&self, buf: &[u8], pos: u64) -> io::Result<()>;
    fn flush(&self) -> io::Result<()>;
}

impl SharedWriteAt for RandomAccessFile {
    fn write_all_at(&self, buf: &[u8], pos: u64) -> io::Result<()> {
        positioned_io::WriteAt::write_all_at(&mut &*self, pos, buf)
    }

    fn flush(&self) -> io::Result<()> {
        positioned_io::WriteAt::flush(&mut &*self)
    }
}

impl<W: SharedWriteAt + ?Sized> SharedWriteAt for &W {
    fn write_all_at(&self, buf: &[u8], pos: u64) -> io::Result<()> {
        SharedWriteAt::write_all_at(*self, buf, pos)
    }

    fn flush(&self) -> io::Result<()> {
        SharedWriteAt::flush(*self)
    }
}

/// An append cursor over a positioned file.
pub struct Positioned<F> {
    file: F,
    position: u64,
}

impl<F> Positioned<F> {
    pub fn new(file: F) -> Self {
        Self { file, position: 0 }
    }

    pub fn with_position(file: F, position: u64) -> Self {
        Self { file, position }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Leave a gap to be backpatched later; returns the gap's offset.
    pub fn reserve(&mut self, len: u64) -> u64 {
        let at = self.position;
        self.position += len;
        at
    }
}

impl<W: SharedWriteAt> Positioned<W> {
    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all_at(buf, self.position)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    /// Backpatch a previously reserved gap without moving the cursor.
    pub fn patch(&self, buf: &[u8], pos: u64) -> io::Result<()> {
        self.file.write_all_at(buf, pos)
    }

    pub fn flush(&self) -> io::Result<()> {
        self.file.flush()
    }
}

impl<R: ReadAt> io::Read for Positioned<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.file.read_at(self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }
}
