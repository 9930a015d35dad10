//! Elapsed-time logging for asynchronous steps

use crate::console_log;
use crate::platform::now_ms;
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

pin_project! {
    /// Future wrapper that logs how long `inner` took to complete
    ///
    /// The clock starts at the first poll, not at construction.
    pub struct Timed<F> {
        #[pin]
        inner: F,
        label: String,
        enabled: bool,
        started: Option<f64>,
    }
}

/// Wrap `inner`, logging `[pipeline] <label> in <n>ms` when it completes
pub fn timed<F: Future>(label: impl Into<String>, enabled: bool, inner: F) -> Timed<F> {
    Timed {
        inner,
        label: label.into(),
        enabled,
        started: None,
    }
}

impl<F: Future> Future for Timed<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let started = *this.started.get_or_insert_with(now_ms);

        match this.inner.poll(cx) {
            Poll::Ready(output) => {
                if *this.enabled {
                    console_log!("[pipeline] {} in {:.0}ms", this.label, now_ms() - started);
                }
                Poll::Ready(output)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
