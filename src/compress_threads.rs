use crossbeam_channel as channel;

use crate::compression::Compressor;
use crate::thread;

/// A pool of worker threads compressing chunks for the resource writer.
///
/// Each request carries one chunk and a dedicated reply channel, so callers
/// can keep several chunks in flight and still collect results in
/// submission order.
pub(crate) struct ParallelCompressor {
    // Destructors run top-down, so the sender closes before the workers
    // are joined.
    sender: channel::Sender<Request>,
    _threads: thread::Joiner<()>,
}

struct Request {
    data: Vec<u8>,
    reply: channel::Sender<Response>,
}

pub(crate) struct Response {
    /// The chunk to store: compressed output, or the original bytes when
    /// the codec declined.
    pub data: Vec<u8>,
    pub compressed: bool,
}

impl ParallelCompressor {
    pub(crate) fn new(compressor: Compressor) -> Self {
        Self::with_threads(compressor, num_cpus::get())
    }

    pub(crate) fn with_threads(compressor: Compressor, threads: usize) -> Self {
        assert!(threads > 0);

        let (tx, rx) = channel::bounded(0);
        let threads = thread::Joiner::new(threads, || thread_fn(rx.clone(), compressor));

        Self {
            sender: tx,
            _threads: threads,
        }
    }

    /// Submit one chunk; the returned channel yields exactly one response.
    pub(crate) fn compress(&self, data: Vec<u8>) -> channel::Receiver<Response> {
        let (tx, rx) = channel::bounded(1);
        self.sender
            .send(Request { data, reply: tx })
            .expect("compressor threads exited early");
        rx
    }
}

fn thread_fn(rx: channel::Receiver<Request>, compressor: Compressor) -> impl FnOnce() {
    move || {
        let mut scratch = Vec::new();
        for request in rx {
            let response = if compressor.compress(&request.data, &mut scratch) {
                Response {
                    data: std::mem::take(&mut scratch),
                    compressed: true,
                }
            } else {
                Response {
                    data: request.data,
                    compressed: false,
                }
            };
            let _ = request.reply.try_send(response);
        }
    }
}

impl std::fmt::Debug for ParallelCompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelCompressor").finish_non_exhaustive()
    }
}
