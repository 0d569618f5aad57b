//! Shared "poll until the provider reports the state we asked for" loop
//! Every create/clone/resize/
//! attach/detach wait uses this instead of four copy-pasted loops.

use std::future::Future;
use std::time::Duration;

use tokio::time::{interval, timeout};

use crate::Error;

/// How often to re-check provider state between polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Poll `check` every [`POLL_INTERVAL`] until it returns `Some(value)`, or
/// until `cap` elapses, whichever comes first — the "two deadlines, the
/// earlier wins" rule. The request's own gRPC deadline is
/// enforced by the transport dropping this future outright when it fires,
/// which `tokio::time::timeout` cooperates with at every `.await` point.
pub async fn poll_until<F, Fut, T>(cap: Duration, mut check: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, Error>>,
{
    let mut ticker = interval(POLL_INTERVAL);

    timeout(cap, async {
        loop {
            ticker.tick().await;

            if let Some(value) = check().await? {
                return Ok(value);
            }
        }
    })
    .await
    .map_err(|_| Error::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn returns_as_soon_as_check_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();

        let result = poll_until(Duration::from_secs(10), move || {
            let calls = calls2.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Ok(if n >= 2 { Some(42) } else { None })
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert!(calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_check_never_succeeds() {
        let result: Result<(), Error> =
            poll_until(Duration::from_secs(5), || async { Ok(None) }).await;

        assert!(matches!(result, Err(Error::Timeout)));
    }
}
