use std::{future::Future, sync::Arc, time::Duration};

use claimshift_common::error::{Result, ShiftError};
use futures::future::select_all;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

// Fires when any of its channels does; a child signal shares its parent's.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    receivers: Vec<watch::Receiver<bool>>,
}

pub fn abort_channel() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (
        AbortHandle { tx: Arc::new(tx) },
        AbortSignal {
            receivers: vec![rx],
        },
    )
}

impl AbortSignal {
    // A signal whose handle is already gone; it can never fire.
    pub fn never() -> Self {
        let (_, signal) = abort_channel();
        signal
    }

    // Returns a signal that fires with this one or with the returned handle.
    // Firing the handle leaves this signal untouched.
    pub fn child(&self) -> (AbortHandle, AbortSignal) {
        let (handle, mut signal) = abort_channel();
        signal.receivers.extend(self.receivers.iter().cloned());
        (handle, signal)
    }

    pub fn is_aborted(&self) -> bool {
        self.receivers.iter().any(|rx| *rx.borrow())
    }

    pub async fn aborted(&self) {
        if self.receivers.is_empty() {
            return std::future::pending().await;
        }
        let waits = self
            .receivers
            .iter()
            .cloned()
            .map(|rx| Box::pin(wait_for_abort(rx)));
        select_all(waits).await;
    }

    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.guard(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }

    pub async fn guard<T>(&self, work: impl Future<Output = Result<T>>) -> Result<T> {
        if self.is_aborted() {
            return Err(ShiftError::Aborted);
        }
        tokio::select! {
            result = work => result,
            _ = self.aborted() => Err(ShiftError::Aborted),
        }
    }
}

async fn wait_for_abort(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use claimshift_common::error::ShiftError;

    use super::{AbortSignal, abort_channel};

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_without_abort() {
        let signal = AbortSignal::never();
        assert!(signal.sleep(Duration::from_secs(30)).await.is_ok());
        assert!(!signal.is_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn abort_interrupts_pending_sleep() {
        let (handle, signal) = abort_channel();
        let sleeper = tokio::spawn({
            let signal = signal.clone();
            async move { signal.sleep(Duration::from_secs(3600)).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.abort();

        let result = sleeper.await.unwrap();
        assert!(matches!(result, Err(ShiftError::Aborted)));
        assert!(signal.is_aborted());
    }

    #[tokio::test]
    async fn guard_refuses_work_after_abort() {
        let (handle, signal) = abort_channel();
        handle.abort();
        let result = signal.guard(async { Ok(1) }).await;
        assert!(matches!(result, Err(ShiftError::Aborted)));
    }

    #[tokio::test(start_paused = true)]
    async fn child_fires_with_parent_but_not_the_reverse() {
        let (parent_handle, parent) = abort_channel();
        let (child_handle, child) = parent.child();

        child_handle.abort();
        assert!(child.is_aborted());
        assert!(child_handle.is_aborted());
        assert!(!parent.is_aborted());

        let (_, sibling) = parent.child();
        let sleeper = tokio::spawn(async move { sibling.sleep(Duration::from_secs(3600)).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        parent_handle.abort();
        assert!(matches!(sleeper.await.unwrap(), Err(ShiftError::Aborted)));
    }
}
