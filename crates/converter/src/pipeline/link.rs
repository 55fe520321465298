//! Bounded links between pipeline stages.
//!
//! Stages run on blocking threads; every exchange parks the thread on a tokio
//! channel and wakes early when the job's cancellation token fires.

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

enum Flow<T> {
    Data(T),
    End,
}

/// Why an exchange did not happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// The job (or an internal abort) was cancelled
    Cancelled,
    /// The other side went away without an end-of-stream marker
    Closed,
}

pub struct LinkSender<T> {
    tx: mpsc::Sender<Flow<T>>,
    cancel: CancellationToken,
    handle: Handle,
}

// derived Clone would require T: Clone
impl<T> Clone for LinkSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
            handle: self.handle.clone(),
        }
    }
}

pub struct LinkReceiver<T> {
    rx: mpsc::Receiver<Flow<T>>,
    cancel: CancellationToken,
    handle: Handle,
}

/// Create a link holding at most `capacity` items.
///
/// Must be called from within a tokio runtime.
pub fn link<T: Send>(capacity: usize, cancel: &CancellationToken) -> (LinkSender<T>, LinkReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = Handle::current();
    (
        LinkSender { tx, cancel: cancel.clone(), handle: handle.clone() },
        LinkReceiver { rx, cancel: cancel.clone(), handle },
    )
}

impl<T: Send> LinkSender<T> {
    /// Block until there is room for `item`
    pub fn send(&self, item: T) -> Result<(), Interrupt> {
        self.exchange(Flow::Data(item))
    }

    /// Mark end of stream
    pub fn finish(self) -> Result<(), Interrupt> {
        self.exchange(Flow::End)
    }

    fn exchange(&self, flow: Flow<T>) -> Result<(), Interrupt> {
        if self.cancel.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        let (tx, cancel) = (&self.tx, &self.cancel);
        self.handle.block_on(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Interrupt::Cancelled),
                sent = tx.send(flow) => sent.map_err(|_| Interrupt::Closed),
            }
        })
    }
}

impl<T: Send> LinkReceiver<T> {
    /// Next item, `None` at end of stream
    pub fn recv(&mut self) -> Result<Option<T>, Interrupt> {
        if self.cancel.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        let (rx, cancel) = (&mut self.rx, &self.cancel);
        let flow = self.handle.block_on(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Interrupt::Cancelled),
                flow = rx.recv() => Ok(flow),
            }
        })?;
        match flow {
            Some(Flow::Data(item)) => Ok(Some(item)),
            Some(Flow::End) => Ok(None),
            None => Err(Interrupt::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_items_then_end_marker() {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = link::<u32>(2, &cancel);
        let producer = tokio::task::spawn_blocking(move || {
            for i in 0..10 {
                tx.send(i)?;
            }
            tx.finish()
        });
        let consumer = tokio::task::spawn_blocking(move || {
            let mut got = Vec::new();
            while let Some(i) = rx.recv().unwrap() {
                got.push(i);
            }
            got
        });
        assert_eq!(producer.await.unwrap(), Ok(()));
        assert_eq!(consumer.await.unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_sender_reads_as_closed() {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = link::<u32>(2, &cancel);
        let result = tokio::task::spawn_blocking(move || {
            tx.send(1)?;
            drop(tx);
            Ok::<_, Interrupt>(())
        })
        .await
        .unwrap();
        assert_eq!(result, Ok(()));
        let got = tokio::task::spawn_blocking(move || (rx.recv(), rx.recv())).await.unwrap();
        assert_eq!(got, (Ok(Some(1)), Err(Interrupt::Closed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_link_applies_backpressure_until_cancelled() {
        let cancel = CancellationToken::new();
        let (tx, _rx) = link::<u32>(3, &cancel);
        let sent = Arc::new(AtomicUsize::new(0));
        let counter = sent.clone();
        let producer = tokio::task::spawn_blocking(move || loop {
            if let Err(e) = tx.send(0) {
                return e;
            }
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        // the producer is parked on a full link, not spinning
        assert_eq!(sent.load(Ordering::SeqCst), 3);
        cancel.cancel();
        assert_eq!(producer.await.unwrap(), Interrupt::Cancelled);
    }
}
