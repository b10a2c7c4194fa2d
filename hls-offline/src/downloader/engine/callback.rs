//! Adapter from callback-style manifest preparation to [`ManifestPreparer`].

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::debug;

use super::traits::{EngineError, ManifestPreparer, PreparedManifest};

/// Completion callback handed to a [`CallbackPreparer`].
pub type PrepareCallback =
    Box<dyn FnOnce(Result<Box<dyn PreparedManifest>, EngineError>) + Send + 'static>;

/// An engine that reports manifest preparation through a callback.
///
/// The callback may be invoked from any thread. Dropping it without calling it
/// is reported to the awaiting side as an internal engine error.
pub trait CallbackPreparer: Send + Sync {
    fn prepare(&self, manifest_url: &str, callback: PrepareCallback);
}

impl<T: CallbackPreparer + ?Sized> CallbackPreparer for std::sync::Arc<T> {
    fn prepare(&self, manifest_url: &str, callback: PrepareCallback) {
        (**self).prepare(manifest_url, callback)
    }
}

/// Wraps a [`CallbackPreparer`] so it can be awaited.
///
/// If the awaiting future is dropped before the callback fires, a manifest
/// delivered afterwards is released immediately.
pub struct CallbackAdapter<P> {
    inner: P,
}

impl<P> CallbackAdapter<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<P: CallbackPreparer> ManifestPreparer for CallbackAdapter<P> {
    async fn prepare(&self, manifest_url: &str) -> Result<Box<dyn PreparedManifest>, EngineError> {
        let (tx, rx) = oneshot::channel();
        let url = manifest_url.to_string();

        self.inner.prepare(
            manifest_url,
            Box::new(move |result| {
                if let Err(Ok(mut orphan)) = tx.send(result) {
                    debug!(url = %url, "Preparation finished after the caller went away, releasing");
                    orphan.release();
                }
            }),
        );

        rx.await.map_err(|_| EngineError::Internal {
            reason: "preparation callback dropped without completing".to_string(),
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticManifest;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Holds the callback until the test decides to fire it.
    #[derive(Default)]
    struct DeferredPreparer {
        pending: Mutex<Option<PrepareCallback>>,
    }

    impl CallbackPreparer for DeferredPreparer {
        fn prepare(&self, _manifest_url: &str, callback: PrepareCallback) {
            *self.pending.lock() = Some(callback);
        }
    }

    impl DeferredPreparer {
        fn fire(&self, result: Result<Box<dyn PreparedManifest>, EngineError>) {
            let callback = self.pending.lock().take().expect("no pending callback");
            callback(result);
        }
    }

    struct ImmediatePreparer {
        manifest: StaticManifest,
    }

    impl CallbackPreparer for ImmediatePreparer {
        fn prepare(&self, _manifest_url: &str, callback: PrepareCallback) {
            callback(Ok(Box::new(self.manifest.clone())));
        }
    }

    struct ForgetfulPreparer;

    impl CallbackPreparer for ForgetfulPreparer {
        fn prepare(&self, _manifest_url: &str, callback: PrepareCallback) {
            drop(callback);
        }
    }

    #[tokio::test]
    async fn test_immediate_callback_resolves() {
        let releases = Arc::new(AtomicUsize::new(0));
        let adapter = CallbackAdapter::new(ImmediatePreparer {
            manifest: StaticManifest::from_heights(&[&[720, 360]]).with_release_counter(releases.clone()),
        });

        let mut manifest = adapter.prepare("https://cdn.example/master.m3u8").await.unwrap();
        assert_eq!(manifest.period_count(), 1);
        manifest.release();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_error_callback_is_propagated() {
        let preparer = Arc::new(DeferredPreparer::default());
        let adapter = CallbackAdapter::new(preparer.clone());

        let handle = tokio::spawn(async move { adapter.prepare("https://bad").await.err() });
        tokio::task::yield_now().await;
        while preparer.pending.lock().is_none() {
            tokio::task::yield_now().await;
        }
        preparer.fire(Err(EngineError::network("connection reset")));

        let err = handle.await.unwrap().expect("expected an error");
        assert!(matches!(err, EngineError::Network { .. }));
    }

    #[tokio::test]
    async fn test_dropped_callback_is_an_error() {
        let adapter = CallbackAdapter::new(ForgetfulPreparer);
        let err = adapter.prepare("https://cdn.example/master.m3u8").await.err().unwrap();
        assert!(matches!(err, EngineError::Internal { .. }));
    }

    #[tokio::test]
    async fn test_late_manifest_is_released() {
        let releases = Arc::new(AtomicUsize::new(0));
        let preparer = Arc::new(DeferredPreparer::default());
        let adapter = CallbackAdapter::new(preparer.clone());

        {
            // Poll once so the callback is registered, then drop the future.
            let fut = adapter.prepare("https://cdn.example/master.m3u8");
            let mut fut = Box::pin(fut);
            assert!(futures::poll!(fut.as_mut()).is_pending());
        }

        preparer.fire(Ok(Box::new(
            StaticManifest::from_heights(&[&[1080]]).with_release_counter(releases.clone()),
        )));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }
}
