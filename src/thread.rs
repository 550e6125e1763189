use std::thread;

/// Owns a set of worker threads and joins them on drop.
#[derive(Debug)]
pub(crate) struct Joiner<T>(Vec<thread::JoinHandle<T>>);

impl<T> Joiner<T> {
    pub(crate) fn new<Gen, ThreadFn>(threads: usize, mut thread_fn: Gen) -> Self
    where
        Gen: FnMut() -> ThreadFn,
        ThreadFn: FnOnce() -> T,
        ThreadFn: Send + 'static,
        T: Send + 'static,
    {
        let mut handles = Vec::with_capacity(threads);
        for _ in 0..threads {
            handles.push(thread::spawn(thread_fn()));
        }
        Self(handles)
    }
}

impl<T> Default for Joiner<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> Drop for Joiner<T> {
    fn drop(&mut self) {
        for handle in self.0.drain(..) {
            let res = handle.join();
            if !thread::panicking() {
                res.unwrap();
            }
        }
    }
}
