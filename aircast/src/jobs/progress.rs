//! Progress update coalescing.
//!
//! Plugins can emit progress at whatever rate their tool produces it; the
//! flusher batches writes to the job record so two updates inside the
//! coalescing window merge into one. The terminal 100% update is always
//! applied.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::types::JobProgress;

/// Window inside which consecutive progress updates are merged.
pub const PROGRESS_COALESCE_WINDOW: Duration = Duration::from_millis(250);

/// Spawn the flusher task for one job. `apply` performs the record write;
/// the task ends when the sender side (the plugin's sink) is dropped, after
/// a final flush of whatever is still pending.
pub fn spawn_progress_flusher(
    mut rx: mpsc::Receiver<JobProgress>,
    apply: impl Fn(JobProgress) + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut pending: Option<JobProgress> = None;
        // None means "never flushed": the first update goes straight out.
        let mut last_flush: Option<Instant> = None;

        loop {
            let deadline = last_flush
                .map(|t| t + PROGRESS_COALESCE_WINDOW)
                .unwrap_or_else(Instant::now);
            tokio::select! {
                update = rx.recv() => match update {
                    Some(update) => {
                        let terminal = update.percent >= 100;
                        pending = Some(update);
                        let window_elapsed = last_flush
                            .is_none_or(|t| t.elapsed() >= PROGRESS_COALESCE_WINDOW);
                        if terminal || window_elapsed {
                            if let Some(p) = pending.take() {
                                apply(p);
                            }
                            last_flush = Some(Instant::now());
                        }
                    }
                    None => {
                        // Sender dropped; flush the remainder and stop.
                        if let Some(p) = pending.take() {
                            apply(p);
                        }
                        break;
                    }
                },
                _ = tokio::time::sleep_until(deadline), if pending.is_some() => {
                    if let Some(p) = pending.take() {
                        apply(p);
                    }
                    last_flush = Some(Instant::now());
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

    fn update(percent: u8) -> JobProgress {
        JobProgress {
            percent,
            stage: "working".to_string(),
            eta_secs: None,
        }
    }

    #[tokio::test]
    async fn burst_of_updates_coalesces() {
        let applied = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(AtomicU8::new(0));
        let (tx, rx) = mpsc::channel(64);
        let (applied_clone, last_clone) = (applied.clone(), last.clone());
        let handle = spawn_progress_flusher(rx, move |p| {
            applied_clone.fetch_add(1, Ordering::SeqCst);
            last_clone.store(p.percent, Ordering::SeqCst);
        });

        for percent in 1..=50u8 {
            tx.send(update(percent)).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        // A 50-update burst collapses to far fewer writes, and the last
        // value always lands.
        assert!(applied.load(Ordering::SeqCst) < 10);
        assert_eq!(last.load(Ordering::SeqCst), 50);
    }

    #[tokio::test]
    async fn terminal_hundred_is_never_dropped() {
        let last = Arc::new(AtomicU8::new(0));
        let (tx, rx) = mpsc::channel(64);
        let last_clone = last.clone();
        let handle = spawn_progress_flusher(rx, move |p| {
            last_clone.store(p.percent, Ordering::SeqCst);
        });

        tx.send(update(42)).await.unwrap();
        tx.send(update(100)).await.unwrap();
        drop(tx);
        handle.await.unwrap();
        assert_eq!(last.load(Ordering::SeqCst), 100);
    }

    #[tokio::test]
    async fn pending_update_flushes_after_window() {
        let last = Arc::new(AtomicU8::new(0));
        let (tx, rx) = mpsc::channel(64);
        let last_clone = last.clone();
        let _handle = spawn_progress_flusher(rx, move |p| {
            last_clone.store(p.percent, Ordering::SeqCst);
        });

        // First update flushes immediately (window already elapsed).
        tx.send(update(10)).await.unwrap();
        // Second lands inside the window and is held...
        tx.send(update(20)).await.unwrap();
        // ...until the window expires.
        tokio::time::sleep(PROGRESS_COALESCE_WINDOW * 2).await;
        assert_eq!(last.load(Ordering::SeqCst), 20);
    }
}
