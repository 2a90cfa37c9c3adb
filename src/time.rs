//! Clocks, deadlines and close signalling shared by every socket layer.
use std::{
    sync::{
        LazyLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use tokio::sync::Notify;

use crate::error::Error;

/// Monotonic reference point for millisecond timestamps and deadlines.
static CLOCK_BASE: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Seconds since the Unix epoch.
pub(crate) fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("SystemTime before UNIX EPOCH")
        .as_secs()
}

/// Returns the current Unix time divided by `granularity` seconds.
///
/// Both the OBFS cookie buckets and the cshirt2 epochs are built on this.
pub(crate) fn current_bucket(granularity: u64) -> u64 {
    unix_secs() / granularity
}

/// Every bucket within `tolerance` of `now`, current bucket first.
pub(crate) fn buckets_around(now: u64, tolerance: i64) -> impl Iterator<Item = u64> {
    core::iter::once(0)
        .chain((1..=tolerance).flat_map(|i| [i, -i]))
        .filter_map(move |offset| now.checked_add_signed(offset))
}

/// Milliseconds on a process-local monotonic clock.
pub(crate) fn now_ms() -> u64 {
    CLOCK_BASE.elapsed().as_millis() as u64
}

/// An optional deadline that can be changed from any thread.
///
/// Zero means "no deadline"; anything else is milliseconds past
/// `CLOCK_BASE`, offset by one.
#[derive(Debug, Default)]
pub(crate) struct Deadline(AtomicU64);

impl Deadline {
    pub(crate) fn set(&self, deadline: Option<Instant>) {
        let raw = match deadline {
            None => 0,
            Some(at) => at.saturating_duration_since(*CLOCK_BASE).as_millis() as u64 + 1,
        };
        self.0.store(raw, Ordering::Release);
    }

    pub(crate) fn get(&self) -> Option<Instant> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            raw => Some(*CLOCK_BASE + Duration::from_millis(raw - 1)),
        }
    }
}

/// An idempotent, sticky close flag that wakes pending operations.
#[derive(Debug, Default)]
pub(crate) struct CloseSignal {
    closed: AtomicBool,
    notify: Notify,
}

impl CloseSignal {
    /// Returns true if this call closed the signal.
    pub(crate) fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        self.notify.notify_waiters();
        first
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the signal is closed.
    pub(crate) async fn closed(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn check(&self) -> Result<(), Error> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }
}

/// Runs `fut` unless the socket closes or the deadline passes first.
pub(crate) async fn guarded<T>(
    deadline: &Deadline,
    close: &CloseSignal,
    fut: impl Future<Output = std::io::Result<T>>,
) -> std::io::Result<T> {
    close.check()?;
    let expiry = async {
        match deadline.get() {
            Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
            None => core::future::pending().await,
        }
    };
    tokio::select! {
        res = fut => res,
        _ = close.closed() => Err(Error::Closed.into()),
        _ = expiry => Err(Error::Timeout.into()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::downcast;

    #[test]
    fn test_buckets_around() {
        let buckets: Vec<u64> = buckets_around(100, 3).collect();
        assert_eq!(buckets, vec![100, 101, 99, 102, 98, 103, 97]);
        let buckets: Vec<u64> = buckets_around(1, 3).collect();
        assert_eq!(buckets, vec![1, 2, 0, 3, 4]);
    }

    #[test]
    fn test_deadline_round_trip() {
        let deadline = Deadline::default();
        assert_eq!(deadline.get(), None);
        let at = Instant::now() + Duration::from_secs(5);
        deadline.set(Some(at));
        let got = deadline.get().unwrap();
        assert!(got <= at && at - got < Duration::from_millis(2));
        deadline.set(None);
        assert_eq!(deadline.get(), None);
    }

    #[tokio::test]
    async fn test_guarded_times_out() {
        let deadline = Deadline::default();
        let close = CloseSignal::default();
        deadline.set(Some(Instant::now() + Duration::from_millis(20)));
        let err = guarded(&deadline, &close, core::future::pending::<std::io::Result<()>>())
            .await
            .unwrap_err();
        assert_eq!(downcast(&err), Some(&Error::Timeout));
    }

    #[tokio::test]
    async fn test_guarded_close_is_sticky() {
        let deadline = Deadline::default();
        let close = std::sync::Arc::new(CloseSignal::default());
        let closer = close.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(closer.close());
        });
        let err = guarded(&deadline, &close, core::future::pending::<std::io::Result<()>>())
            .await
            .unwrap_err();
        assert_eq!(downcast(&err), Some(&Error::Closed));
        assert!(!close.close());
        let err = guarded(&deadline, &close, async { Ok(()) }).await.unwrap_err();
        assert_eq!(downcast(&err), Some(&Error::Closed));
    }
}
