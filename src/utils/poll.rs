//! Bounded polling for conditions that have no event to wait on
//! (process exit, socket readiness).

use std::time::Duration;

use anyhow::{bail, Result};

/// Polls `check` at `interval` until it returns `Ok(true)`, returns an
/// error, or `timeout` expires. The check runs once before the first
/// sleep so an already-satisfied condition returns immediately.
pub async fn wait_for<F>(timeout: Duration, interval: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> Result<bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check()? {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("timeout after {timeout:?}");
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn immediate_success_does_not_sleep() {
        wait_for(Duration::from_secs(5), Duration::from_secs(5), || Ok(true))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn eventually_true() {
        let mut n = 0;
        wait_for(Duration::from_secs(2), Duration::from_millis(1), || {
            n += 1;
            Ok(n >= 3)
        })
        .await
        .unwrap();
        assert_eq!(n, 3);
    }

    #[tokio::test]
    async fn timeout_surfaces() {
        let err = wait_for(Duration::from_millis(20), Duration::from_millis(5), || {
            Ok(false)
        })
        .await
        .unwrap_err();
        assert!(format!("{err}").contains("timeout"));
    }

    #[tokio::test]
    async fn check_error_aborts() {
        let err = wait_for(Duration::from_secs(1), Duration::from_millis(1), || {
            bail!("probe exploded")
        })
        .await
        .unwrap_err();
        assert!(format!("{err}").contains("probe exploded"));
    }
}
