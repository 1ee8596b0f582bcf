//! Pass-through reader that reports cumulative bytes read.
//!
//! Wraps any `AsyncRead` and calls a callback with the running total after each
//! read that produced data. Nothing is buffered beyond what the caller asked
//! for, and read errors from the inner reader are returned untouched.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, ReadBuf};

pin_project! {
    pub struct ProgressReader<R, F> {
        #[pin]
        inner: R,
        on_progress: F,
        bytes_read: u64,
        reported: bool,
    }
}

impl<R, F> ProgressReader<R, F>
where
    R: AsyncRead,
    F: FnMut(u64),
{
    pub fn new(inner: R, on_progress: F) -> Self {
        Self {
            inner,
            on_progress,
            bytes_read: 0,
            reported: false,
        }
    }
}

impl<R, F> ProgressReader<R, F> {
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R, F> AsyncRead for ProgressReader<R, F>
where
    R: AsyncRead,
    F: FnMut(u64),
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();

        match this.inner.poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = (buf.filled().len() - before) as u64;
                // EOF only reports when nothing has been reported yet, so totals
                // stay strictly increasing and an empty stream still notifies once.
                if n > 0 || !*this.reported {
                    *this.bytes_read += n;
                    *this.reported = true;
                    (this.on_progress)(*this.bytes_read);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}
