use std::{ops::Deref, pin::Pin, sync::Arc, task::Poll, time::Duration};

use futures::{
    future::{FutureExt, RemoteHandle},
    Future, Stream,
};

use crate::{Error, Result};

mod timeout;
pub use timeout::{Timeout, TimeoutError};

/// indicates which executor is used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    /// Tokio executor
    Tokio,
    /// async-std executor
    AsyncStd,
}

/// Wrapper trait abstracting the Tokio and async-std executors
pub trait Executor: Clone + Send + Sync + 'static {
    /// spawns a new task
    #[allow(clippy::result_unit_err)]
    fn spawn(&self, f: Pin<Box<dyn Future<Output = ()> + Send>>) -> std::result::Result<(), ()>;

    /// returns a Stream that will produce at regular intervals
    fn interval(&self, duration: Duration) -> Interval;
    /// waits for a configurable time
    fn delay(&self, duration: Duration) -> Delay;

    fn timeout<T>(&self, duration: Duration, fut: T) -> Timeout<T>
    where
        T: Future,
    {
        Timeout::new(fut, self.delay(duration))
    }

    /// returns which executor is currently used
    fn kind(&self) -> ExecutorKind;

    /// spawns a task whose output can be awaited through the returned handle,
    /// dropping the handle aborts the task
    fn spawn_task<F>(&self, f: F) -> Result<RemoteHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (remote, handle) = f.remote_handle();
        self.spawn(Box::pin(remote))
            .map_err(|_| Error::Custom("failed to spawn task on executor".into()))?;
        Ok(handle)
    }
}

/// Wrapper for the Tokio executor
#[cfg(feature = "tokio-runtime")]
#[derive(Clone, Debug)]
pub struct TokioExecutor;

#[cfg(feature = "tokio-runtime")]
impl Executor for TokioExecutor {
    fn spawn(&self, f: Pin<Box<dyn Future<Output = ()> + Send>>) -> std::result::Result<(), ()> {
        tokio::task::spawn(f);
        Ok(())
    }

    fn interval(&self, duration: Duration) -> Interval {
        Interval::Tokio(tokio::time::interval(duration))
    }

    fn delay(&self, duration: Duration) -> Delay {
        Delay::Tokio(Box::pin(tokio::time::sleep(duration)))
    }

    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Tokio
    }
}

/// Wrapper for the async-std executor
#[cfg(feature = "async-std-runtime")]
#[derive(Clone, Debug)]
pub struct AsyncStdExecutor;

#[cfg(feature = "async-std-runtime")]
impl Executor for AsyncStdExecutor {
    fn spawn(&self, f: Pin<Box<dyn Future<Output = ()> + Send>>) -> std::result::Result<(), ()> {
        async_std::task::spawn(f);
        Ok(())
    }

    fn interval(&self, duration: Duration) -> Interval {
        Interval::AsyncStd(async_std::stream::interval(duration))
    }

    fn delay(&self, duration: Duration) -> Delay {
        Delay::AsyncStd(Box::pin(async_std::task::sleep(duration)))
    }

    fn kind(&self) -> ExecutorKind {
        ExecutorKind::AsyncStd
    }
}

impl<Exe: Executor> Executor for Arc<Exe> {
    fn spawn(&self, f: Pin<Box<dyn Future<Output = ()> + Send>>) -> std::result::Result<(), ()> {
        self.deref().spawn(f)
    }

    fn interval(&self, duration: Duration) -> Interval {
        self.deref().interval(duration)
    }

    fn delay(&self, duration: Duration) -> Delay {
        self.deref().delay(duration)
    }

    fn kind(&self) -> ExecutorKind {
        self.deref().kind()
    }
}

/// a `Stream` producing a `()` at regular time intervals
pub enum Interval {
    /// wrapper for tokio's interval
    #[cfg(feature = "tokio-runtime")]
    Tokio(tokio::time::Interval),
    /// wrapper for async-std's interval
    #[cfg(feature = "async-std-runtime")]
    AsyncStd(async_std::stream::Interval),
    #[cfg(all(not(feature = "tokio-runtime"), not(feature = "async-std-runtime")))]
    PlaceHolder,
}

impl Stream for Interval {
    type Item = ();

    fn poll_next(self: Pin<&mut Self>, cx: &mut std::task::Context) -> Poll<Option<Self::Item>> {
        match self.get_mut() {
            #[cfg(feature = "tokio-runtime")]
            Interval::Tokio(j) => match j.poll_tick(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(_) => Poll::Ready(Some(())),
            },
            #[cfg(feature = "async-std-runtime")]
            Interval::AsyncStd(j) => Pin::new(j).poll_next(cx),
            #[cfg(all(not(feature = "tokio-runtime"), not(feature = "async-std-runtime")))]
            Interval::PlaceHolder => {
                unimplemented!(
                    "please activate one of the following cargo features: tokio-runtime, \
                     async-std-runtime"
                )
            }
        }
    }
}

/// a future producing a `()` after some time
pub enum Delay {
    /// wrapper around tokio's `Sleep`
    #[cfg(feature = "tokio-runtime")]
    Tokio(Pin<Box<tokio::time::Sleep>>),
    /// wrapper around async-std's `sleep`
    #[cfg(feature = "async-std-runtime")]
    AsyncStd(Pin<Box<dyn Future<Output = ()> + Send>>),
    #[cfg(all(not(feature = "tokio-runtime"), not(feature = "async-std-runtime")))]
    PlaceHolder,
}

impl Future for Delay {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context) -> Poll<Self::Output> {
        match self.get_mut() {
            #[cfg(feature = "tokio-runtime")]
            Delay::Tokio(d) => d.as_mut().poll(cx),
            #[cfg(feature = "async-std-runtime")]
            Delay::AsyncStd(d) => d.as_mut().poll(cx),
            #[cfg(all(not(feature = "tokio-runtime"), not(feature = "async-std-runtime")))]
            Delay::PlaceHolder => {
                unimplemented!(
                    "please activate one of the following cargo features: tokio-runtime, \
                     async-std-runtime"
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;

    use crate::executor::{AsyncStdExecutor, Executor, ExecutorKind, TokioExecutor};

    #[tokio::test]
    async fn timeout() {
        let executor = AsyncStdExecutor;
        let (_tx, rx) = futures::channel::oneshot::channel::<i32>();
        assert!(executor.timeout(Duration::from_millis(1), rx).await.is_err());
    }

    #[tokio::test]
    async fn timeout_ready_future() {
        let executor = TokioExecutor;
        let (tx, rx) = futures::channel::oneshot::channel::<i32>();
        let _ = tx.send(1);
        let value = executor.timeout(Duration::from_millis(100), rx).await;
        assert_eq!(value.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn spawn_task_returns_output() {
        let executor = TokioExecutor;
        assert_eq!(executor.kind(), ExecutorKind::Tokio);
        let handle = executor.spawn_task(async { 40 + 2 }).unwrap();
        assert_eq!(handle.await, 42);
    }

    #[tokio::test]
    async fn interval_ticks() {
        let executor = TokioExecutor;
        let mut interval = executor.interval(Duration::from_millis(5));
        interval.next().await;
        interval.next().await;
    }
}
