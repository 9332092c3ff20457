use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_channel::oneshot;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Upper bound on the number of buffers handed to one gathering write.
const MAX_GATHER: usize = 200;

/// A write queue that serializes all writers onto one sink.
///
/// Buffers are written strictly in enqueue order and at most one write is in
/// flight at a time; whoever enqueues onto an empty queue implicitly drives
/// the writing until the queue drains. Each pending write completes, in FIFO
/// order, once the sink has accepted all of its bytes.
///
/// A sink error poisons the queue: every pending write and every later
/// enqueue observes the same error.
pub struct WriteQueue<W> {
    shared: Arc<Mutex<State<W>>>,
}

impl<W> Clone for WriteQueue<W> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct State<W> {
    // taken out while a write is in flight
    io: Option<W>,
    queue: VecDeque<Pending>,
    writing: bool,
    failed: Option<Arc<io::Error>>,
}

struct Pending {
    buf: Bytes,
    offset: usize,
    done: oneshot::Sender<io::Result<usize>>,
}

fn shared_error(err: &Arc<io::Error>) -> io::Error {
    io::Error::new(err.kind(), Arc::clone(err))
}

impl<W> WriteQueue<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(io: W) -> Self {
        Self {
            shared: Arc::new(Mutex::new(State {
                io: Some(io),
                queue: VecDeque::new(),
                writing: false,
                failed: None,
            })),
        }
    }

    /// Queue `buf` for writing. The returned receiver resolves with the
    /// buffer length once the sink has accepted every byte, or with the
    /// error that poisoned the queue.
    pub fn enqueue(&self, buf: Bytes) -> oneshot::Receiver<io::Result<usize>> {
        let (done, rx) = oneshot::channel();

        let mut state = self.shared.lock().unwrap();

        if let Some(err) = &state.failed {
            let _ = done.send(Err(shared_error(err)));
            return rx;
        }

        if state.io.is_none() && !state.writing {
            let _ = done.send(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write queue is closed",
            )));
            return rx;
        }

        state.queue.push_back(Pending {
            buf,
            offset: 0,
            done,
        });

        if !state.writing {
            state.writing = true;
            tokio::spawn(drive(Arc::clone(&self.shared)));
        }

        rx
    }

    /// Queue `buf` and wait for its completion.
    pub async fn write(&self, buf: Bytes) -> io::Result<usize> {
        match self.enqueue(buf).await {
            Ok(result) => result,
            Err(_canceled) => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }

    /// Wait until everything queued so far has been written.
    pub async fn flush(&self) -> io::Result<()> {
        self.write(Bytes::new()).await.map(|_| ())
    }

    /// Number of writes waiting or in flight.
    pub fn pending(&self) -> usize {
        self.shared.lock().unwrap().queue.len()
    }

    /// Close the queue: every pending write and every later enqueue fails.
    /// The sink is dropped once the in-flight write finishes.
    pub fn close(&self) {
        let mut state = self.shared.lock().unwrap();

        if state.failed.is_none() {
            state.failed = Some(Arc::new(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write queue is closed",
            )));
        }

        fail_all(&mut state);
        state.io = None;
    }
}

fn fail_all<W>(state: &mut State<W>) {
    let err = state
        .failed
        .clone()
        .unwrap_or_else(|| Arc::new(io::ErrorKind::BrokenPipe.into()));

    for pending in state.queue.drain(..) {
        let _ = pending.done.send(Err(shared_error(&err)));
    }
}

async fn drive<W>(shared: Arc<Mutex<State<W>>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        // snapshot a chunk under the lock; the write itself happens outside
        let (mut io, chunk) = {
            let mut state = shared.lock().unwrap();

            if state.failed.is_some() {
                fail_all(&mut state);
                state.writing = false;
                return;
            }

            if state.queue.is_empty() {
                state.writing = false;
                return;
            }

            let Some(io) = state.io.take() else {
                fail_all(&mut state);
                state.writing = false;
                return;
            };

            let chunk: Vec<Bytes> = state
                .queue
                .iter()
                .take(MAX_GATHER)
                .map(|pending| pending.buf.slice(pending.offset..))
                .collect();

            (io, chunk)
        };

        let slices: Vec<IoSlice<'_>> = chunk.iter().map(|buf| IoSlice::new(buf)).collect();
        let total: usize = chunk.iter().map(|buf| buf.len()).sum();

        let result = if total == 0 {
            Ok(0)
        } else {
            io.write_vectored(&slices).await
        };

        let mut state = shared.lock().unwrap();

        match result {
            Ok(n) if n == 0 && total > 0 => {
                let err = Arc::new(io::Error::from(io::ErrorKind::WriteZero));
                state.failed = Some(err);
                fail_all(&mut state);
                state.writing = false;
                return;
            }

            Ok(mut n) => {
                if state.failed.is_some() {
                    fail_all(&mut state);
                    state.writing = false;
                    return;
                }

                state.io = Some(io);

                loop {
                    let Some(front) = state.queue.front_mut() else {
                        break;
                    };

                    let left = front.buf.len() - front.offset;

                    if n >= left {
                        n -= left;
                        let pending = state.queue.pop_front().unwrap();
                        let _ = pending.done.send(Ok(pending.buf.len()));

                        // stop at the first entry the sink has not consumed,
                        // unless it is a zero-length marker
                        if n == 0
                            && !state
                                .queue
                                .front()
                                .is_some_and(|next| next.buf.len() == next.offset)
                        {
                            break;
                        }
                    } else {
                        front.offset += n;
                        break;
                    }
                }
            }

            Err(err) => {
                let err = Arc::new(err);
                state.failed = Some(err);
                fail_all(&mut state);
                state.writing = false;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::task::{Context, Poll, Waker};

    /// Accepts at most `max_per_write` bytes per call and records how many
    /// slices each gathering write carried. Starts gated: polls are pending
    /// until [`Gate::open`] is called.
    struct MockWriter {
        gate: Arc<Gate>,
        written: Arc<StdMutex<Vec<u8>>>,
        slice_counts: Arc<StdMutex<Vec<usize>>>,
        max_per_write: usize,
        fail_after: Option<usize>,
    }

    #[derive(Default)]
    struct Gate {
        open: AtomicBool,
        waker: StdMutex<Option<Waker>>,
    }

    impl Gate {
        fn open(&self) {
            self.open.store(true, Ordering::SeqCst);
            if let Some(waker) = self.waker.lock().unwrap().take() {
                waker.wake();
            }
        }
    }

    impl MockWriter {
        fn new(max_per_write: usize) -> (Self, Arc<Gate>, Arc<StdMutex<Vec<u8>>>) {
            let gate = Arc::new(Gate::default());
            gate.open.store(true, Ordering::SeqCst);

            let written = Arc::new(StdMutex::new(Vec::new()));
            let writer = Self {
                gate: Arc::clone(&gate),
                written: Arc::clone(&written),
                slice_counts: Arc::default(),
                max_per_write,
                fail_after: None,
            };

            (writer, gate, written)
        }

        fn gated(max_per_write: usize) -> (Self, Arc<Gate>, Arc<StdMutex<Vec<usize>>>) {
            let (writer, gate, _) = Self::new(max_per_write);
            gate.open.store(false, Ordering::SeqCst);
            let counts = Arc::clone(&writer.slice_counts);

            (writer, gate, counts)
        }
    }

    impl AsyncWrite for MockWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.poll_write_vectored(cx, &[IoSlice::new(buf)])
        }

        fn poll_write_vectored(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            bufs: &[IoSlice<'_>],
        ) -> Poll<io::Result<usize>> {
            if !self.gate.open.load(Ordering::SeqCst) {
                *self.gate.waker.lock().unwrap() = Some(cx.waker().clone());
                return Poll::Pending;
            }

            self.slice_counts.lock().unwrap().push(bufs.len());

            let mut written = self.written.lock().unwrap();

            if let Some(limit) = self.fail_after {
                if written.len() >= limit {
                    return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
                }
            }

            let mut budget = self.max_per_write;
            let mut accepted = 0;

            for buf in bufs {
                let n = buf.len().min(budget);
                written.extend_from_slice(&buf[..n]);
                accepted += n;
                budget -= n;

                if budget == 0 {
                    break;
                }
            }

            Poll::Ready(Ok(accepted))
        }

        fn is_write_vectored(&self) -> bool {
            true
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn writes_complete_in_fifo_order_across_partial_writes() {
        // 5 bytes per call forces every buffer to be split
        let (writer, _, written) = MockWriter::new(5);
        let queue = WriteQueue::new(writer);

        let a = queue.enqueue(Bytes::from_static(b"aaaaaaaa"));
        let b = queue.enqueue(Bytes::from_static(b"bb"));
        let c = queue.enqueue(Bytes::from_static(b"cccccc"));

        assert_eq!(a.await.unwrap().unwrap(), 8);
        assert_eq!(b.await.unwrap().unwrap(), 2);
        assert_eq!(c.await.unwrap().unwrap(), 6);

        assert_eq!(&written.lock().unwrap()[..], b"aaaaaaaabbcccccc");
    }

    #[tokio::test]
    async fn one_gathering_write_carries_at_most_the_cap() {
        let (writer, gate, counts) = MockWriter::gated(usize::MAX);
        let queue = WriteQueue::new(writer);

        let receivers: Vec<_> = (0..250)
            .map(|_| queue.enqueue(Bytes::from_static(b"x")))
            .collect();

        gate.open();

        for rx in receivers {
            assert_eq!(rx.await.unwrap().unwrap(), 1);
        }

        let counts = counts.lock().unwrap();
        assert!(counts.iter().all(|&n| n <= 200), "counts: {counts:?}");
        assert_eq!(counts.iter().max(), Some(&200));
    }

    #[tokio::test]
    async fn sink_error_fails_every_pending_and_later_write() {
        let (mut writer, gate, _) = MockWriter::gated(usize::MAX);
        writer.fail_after = Some(0);
        let queue = WriteQueue::new(writer);

        let a = queue.enqueue(Bytes::from_static(b"aaaa"));
        let b = queue.enqueue(Bytes::from_static(b"bbbb"));
        gate.open();

        assert_eq!(
            a.await.unwrap().unwrap_err().kind(),
            io::ErrorKind::ConnectionReset
        );
        assert_eq!(
            b.await.unwrap().unwrap_err().kind(),
            io::ErrorKind::ConnectionReset
        );

        // the queue stays poisoned
        assert_eq!(
            queue.write(Bytes::from_static(b"c")).await.unwrap_err().kind(),
            io::ErrorKind::ConnectionReset
        );
    }

    #[tokio::test]
    async fn close_rejects_new_writes() {
        let (writer, _, written) = MockWriter::new(usize::MAX);
        let queue = WriteQueue::new(writer);

        queue.write(Bytes::from_static(b"early")).await.unwrap();
        queue.close();

        assert_eq!(
            queue.write(Bytes::from_static(b"late")).await.unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );

        assert_eq!(&written.lock().unwrap()[..], b"early");
    }

    #[tokio::test]
    async fn flush_waits_for_earlier_writes() {
        let (writer, gate, written) = MockWriter::new(usize::MAX);
        gate.open.store(false, Ordering::SeqCst);
        let queue = WriteQueue::new(writer);

        let pending = queue.enqueue(Bytes::from_static(b"payload"));
        let flush = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.flush().await })
        };

        gate.open();

        flush.await.unwrap().unwrap();
        assert_eq!(pending.await.unwrap().unwrap(), 7);
        assert_eq!(&written.lock().unwrap()[..], b"payload");
    }
}
