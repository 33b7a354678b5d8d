use std::future::Future;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::time::Instant;

/// Polls `f` until it yields a value. Swap actors run on the same runtime,
/// so polling starts fast and backs off to at most 100ms.
pub async fn wait_for<T, F, Fut>(description: &str, timeout: Duration, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + timeout;
    let mut interval = Duration::from_millis(5);
    let mut polls = 0u32;

    loop {
        polls += 1;
        if let Some(value) = f().await.with_context(|| format!("poll {description}"))? {
            return Ok(value);
        }
        if Instant::now() >= deadline {
            anyhow::bail!("timeout waiting for {description} after {polls} polls");
        }

        tokio::time::sleep(interval).await;
        interval = (interval * 2).min(Duration::from_millis(100));
    }
}
