use crate::store::{LeaseManager, LeaseToken};
use rand::Rng;
use std::time::Duration;

/// Lease is a held, time-bounded exclusive lease.
///
/// Leases should be released with `release()`. A Lease which is dropped
/// while still held (for example, because its holder panicked) is released
/// by a background task, and otherwise self-expires after its hold.
#[derive(Debug)]
pub struct Lease<L: LeaseManager> {
    manager: L,
    key: String,
    token: Option<LeaseToken>,
}

impl<L: LeaseManager> Lease<L> {
    /// Acquire the lease `key` for `hold`, waiting up to `wait` for it
    /// to become available. Returns None if the wait elapsed.
    pub async fn acquire(
        manager: &L,
        key: String,
        hold: Duration,
        wait: Duration,
    ) -> anyhow::Result<Option<Self>> {
        let deadline = tokio::time::Instant::now() + wait;
        let mut attempt = 0u32;

        loop {
            if let Some(token) = manager.try_acquire(&key, hold).await? {
                return Ok(Some(Self {
                    manager: manager.clone(),
                    key,
                    token: Some(token),
                }));
            }

            // Back off from 10ms up to 200ms, with jitter in [0.5, 1.5).
            attempt += 1;
            let backoff = Duration::from_millis(10 * u64::from(attempt.min(20)));
            let jitter = 0.5 + rand::thread_rng().gen::<f64>();
            let sleep_until = tokio::time::Instant::now() + backoff.mul_f64(jitter);

            if sleep_until >= deadline {
                return Ok(None);
            }
            tokio::time::sleep_until(sleep_until).await;
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lease. Returns false if it had already expired.
    pub async fn release(mut self) -> anyhow::Result<bool> {
        let Some(token) = self.token.take() else {
            return Ok(false);
        };
        let released = self.manager.release(&self.key, token).await?;

        if !released {
            tracing::warn!(key = %self.key, "lease expired before it was released");
        }
        Ok(released)
    }
}

impl<L: LeaseManager> Drop for Lease<L> {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(key = %self.key, "lease dropped outside of a runtime (it will expire)");
            return;
        };
        let (manager, key) = (self.manager.clone(), std::mem::take(&mut self.key));

        handle.spawn(async move {
            if let Err(err) = manager.release(&key, token).await {
                tracing::warn!(%key, ?err, "failed to release dropped lease (it will expire)");
            }
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::memory::MemoryLeases;

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let leases = MemoryLeases::default();
        let hold = Duration::from_secs(10);

        let first = Lease::acquire(&leases, "k".to_string(), hold, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        // A contending acquisition times out while the lease is held.
        let contended = Lease::acquire(&leases, "k".to_string(), hold, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(contended.is_none());

        // But succeeds once it's released during the wait.
        let releaser = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert!(first.release().await.unwrap());
        };
        let (second, ()) = tokio::join!(
            Lease::acquire(&leases, "k".to_string(), hold, Duration::from_secs(5)),
            releaser
        );
        let second = second.unwrap().unwrap();
        assert_eq!(second.key(), "k");
        assert!(second.release().await.unwrap());
        assert!(!leases.is_held("k"));
    }

    #[tokio::test]
    async fn test_dropped_lease_is_released() {
        let leases = MemoryLeases::default();

        let lease = Lease::acquire(
            &leases,
            "k".to_string(),
            Duration::from_secs(10),
            Duration::ZERO,
        )
        .await
        .unwrap()
        .unwrap();
        assert!(leases.is_held("k"));

        std::mem::drop(lease);
        for _ in 0..100 {
            if !leases.is_held("k") {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("dropped lease was never released");
    }
}
