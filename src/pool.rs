use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use positioned_io::RandomAccessFile;
use snafu::ResultExt;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::{fmt, mem};

use crate::errors::{OpenSnafu, Result};

/// How many handle slots the file pool grows by at a time.
const FILE_POOL_INCREMENT: usize = 4;

pub(crate) trait Recyclable {
    fn new() -> Self;
    fn reset(&mut self);
}

impl Recyclable for Vec<u8> {
    fn new() -> Self {
        Vec::new()
    }

    fn reset(&mut self) {
        self.clear();
    }
}

/// A bounded pool of recyclable scratch values.
pub(crate) struct Pool<T> {
    items: Mutex<Vec<T>>,
}

impl<T: Recyclable> Pool<T> {
    pub(crate) fn new(size: usize, capacity: usize) -> Self {
        let mut items = Vec::with_capacity(capacity);
        items.resize_with(size, T::new);
        Self {
            items: Mutex::new(items),
        }
    }

    pub(crate) fn get(&self) -> Handle<'_, T> {
        let value = self.items.lock().pop().unwrap_or_else(T::new);
        Handle {
            value: ManuallyDrop::new(value),
            pool: self,
        }
    }

    fn return_item(&self, mut item: T) {
        let mut items = self.items.lock();
        if items.len() < items.capacity() {
            item.reset();
            items.push(item);
        }
    }
}

pub(crate) struct Handle<'a, T: Recyclable> {
    value: ManuallyDrop<T>,
    pool: &'a Pool<T>,
}

impl<T: Recyclable> Deref for Handle<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<T: Recyclable> DerefMut for Handle<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.value
    }
}

impl<T: fmt::Debug + Recyclable> fmt::Debug for Handle<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value.fmt(f)
    }
}

impl<T: Recyclable> Drop for Handle<'_, T> {
    fn drop(&mut self) {
        let item = unsafe { ManuallyDrop::take(&mut self.value) };
        self.pool.return_item(item);
    }
}

/// Scratch buffers for chunk staging, shared process-wide.
pub(crate) fn chunk_buf() -> Handle<'static, Vec<u8>> {
    static INSTANCE: OnceCell<Pool<Vec<u8>>> = OnceCell::new();

    let threads = num_cpus::get();
    INSTANCE.get_or_init(|| Pool::new(threads, threads * 2)).get()
}

/// A bounded pool of read handles onto one archive file.
///
/// Concurrent readers each acquire their own handle so no seek position is
/// shared. The pool starts empty, opens handles on demand, and caches up
/// to `max_cached` of them, growing its slot table in small increments.
/// Nothing does I/O while the lock is held: handles are opened and closed
/// outside it.
pub struct FilePool {
    path: PathBuf,
    handles: Mutex<Vec<RandomAccessFile>>,
    max_cached: usize,
}

impl FilePool {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            handles: Mutex::new(Vec::new()),
            max_cached: 2 * num_cpus::get(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take a handle, opening a fresh one when the pool is dry.
    pub fn acquire(&self) -> Result<FileGuard<'_>> {
        let cached = self.handles.lock().pop();
        let file = match cached {
            Some(file) => file,
            None => RandomAccessFile::open(&self.path).context(OpenSnafu {
                path: self.path.clone(),
            })?,
        };
        Ok(FileGuard {
            file: ManuallyDrop::new(file),
            pool: self,
        })
    }

    fn release(&self, file: RandomAccessFile) {
        let mut handles = self.handles.lock();
        if handles.len() < self.max_cached {
            if handles.len() == handles.capacity() {
                handles.reserve(FILE_POOL_INCREMENT);
            }
            handles.push(file);
            return;
        }
        drop(handles);
        // Over the cache bound: close outside the lock.
        drop(file);
    }
}

impl fmt::Debug for FilePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilePool")
            .field("path", &self.path)
            .field("cached", &self.handles.lock().len())
            .finish()
    }
}

/// A pooled file handle; returns itself to the pool on drop.
#[derive(Debug)]
pub struct FileGuard<'a> {
    file: ManuallyDrop<RandomAccessFile>,
    pool: &'a FilePool,
}

impl Deref for FileGuard<'_> {
    type Target = RandomAccessFile;

    fn deref(&self) -> &Self::Target {
        &self.file
    }
}

impl Drop for FileGuard<'_> {
    fn drop(&mut self) {
        let file = unsafe { ManuallyDrop::take(&mut self.file) };
        self.pool.release(file);
    }
}
