//! Progress store accessor.
//!
//! Wraps the repository so every successful write is also published to
//! observers as a full record snapshot.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::Result;
use crate::database::models::{DownloadRecord, DownloadStatus, ProgressUpdate};
use crate::database::repositories::DownloadRepository;

/// Shared handle to the download store plus its change feed.
#[derive(Clone)]
pub struct ProgressStore {
    repo: Arc<dyn DownloadRepository>,
    tx: broadcast::Sender<DownloadRecord>,
}

impl ProgressStore {
    pub fn new(repo: Arc<dyn DownloadRepository>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { repo, tx }
    }

    pub fn repository(&self) -> &Arc<dyn DownloadRepository> {
        &self.repo
    }

    pub async fn get(&self, content_id: &str) -> Result<Option<DownloadRecord>> {
        self.repo.get_record(content_id).await
    }

    /// Insert the record unless one exists. Publishes it when inserted.
    pub async fn create_if_absent(&self, record: &DownloadRecord) -> Result<bool> {
        let inserted = self.repo.create_if_absent(record).await?;
        if inserted {
            self.broadcast(&record.content_id).await?;
        }
        Ok(inserted)
    }

    /// Persist a progress update and publish the resulting snapshot.
    pub async fn publish(&self, update: &ProgressUpdate) -> Result<()> {
        self.repo.upsert_progress(update).await?;
        self.broadcast(&update.content_id).await
    }

    /// Persist a status change and publish the resulting snapshot.
    pub async fn publish_status(&self, content_id: &str, status: DownloadStatus) -> Result<bool> {
        let updated = self.repo.update_status(content_id, status).await?;
        if updated {
            self.broadcast(content_id).await?;
        }
        Ok(updated)
    }

    async fn broadcast(&self, content_id: &str) -> Result<()> {
        match self.repo.get_record(content_id).await? {
            // No receivers is fine.
            Some(record) => {
                let _ = self.tx.send(record);
            }
            None => warn!(content_id = %content_id, "Record vanished right after write"),
        }
        Ok(())
    }

    /// Every published snapshot, for all content ids.
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadRecord> {
        self.tx.subscribe()
    }

    /// Snapshots of one record: the stored state first, then every change.
    ///
    /// The store is not read until the stream is polled. Each call returns an
    /// independent stream; a lagging stream re-reads the store instead of
    /// replaying missed snapshots. Snapshots no newer than the last one
    /// yielded are skipped, so revisions only move forward.
    pub fn observe(&self, content_id: impl Into<String>) -> BoxStream<'static, DownloadRecord> {
        let state = ObserveState {
            repo: self.repo.clone(),
            rx: self.tx.subscribe(),
            content_id: content_id.into(),
            started: false,
            last: None,
        };

        stream::unfold(state, |mut state| async move {
            let record = state.next_record().await?;
            state.last = Some(record.clone());
            Some((record, state))
        })
        .boxed()
    }
}

struct ObserveState {
    repo: Arc<dyn DownloadRepository>,
    rx: broadcast::Receiver<DownloadRecord>,
    content_id: String,
    started: bool,
    last: Option<DownloadRecord>,
}

impl ObserveState {
    async fn next_record(&mut self) -> Option<DownloadRecord> {
        if !self.started {
            self.started = true;
            if let Some(record) = self.reload().await {
                return Some(record);
            }
        }

        loop {
            let candidate = match self.rx.recv().await {
                Ok(record) if record.content_id == self.content_id => Some(record),
                Ok(_) => None,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(content_id = %self.content_id, skipped, "Observer lagged, reloading");
                    self.reload().await
                }
                Err(RecvError::Closed) => return None,
            };

            if let Some(record) = candidate
                && self.is_newer(&record)
            {
                return Some(record);
            }
        }
    }

    fn is_newer(&self, record: &DownloadRecord) -> bool {
        self.last
            .as_ref()
            .is_none_or(|last| record.revision > last.revision)
    }

    async fn reload(&self) -> Option<DownloadRecord> {
        match self.repo.get_record(&self.content_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(content_id = %self.content_id, error = %e, "Failed to read record for observer");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::MemoryDownloadRepository;

    fn store() -> ProgressStore {
        ProgressStore::new(Arc::new(MemoryDownloadRepository::new()), 16)
    }

    #[tokio::test]
    async fn test_publish_broadcasts_snapshot() {
        let store = store();
        let mut rx = store.subscribe();

        store
            .create_if_absent(&DownloadRecord::queued("ep-1", 1))
            .await
            .unwrap();
        store
            .publish(&ProgressUpdate::downloading("ep-1", 12))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().status, DownloadStatus::Queued);
        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.status, DownloadStatus::Downloading);
        assert_eq!(snapshot.progress, 12);
    }

    #[tokio::test]
    async fn test_create_existing_does_not_publish() {
        let store = store();
        store
            .create_if_absent(&DownloadRecord::queued("ep-1", 1))
            .await
            .unwrap();

        let mut rx = store.subscribe();
        assert!(
            !store
                .create_if_absent(&DownloadRecord::queued("ep-1", 2))
                .await
                .unwrap()
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_observe_starts_with_stored_state() {
        let store = store();
        store
            .publish(&ProgressUpdate::downloading("ep-1", 40))
            .await
            .unwrap();

        let mut updates = store.observe("ep-1");
        let first = updates.next().await.unwrap();
        assert_eq!(first.progress, 40);

        store
            .publish(&ProgressUpdate::downloading("ep-2", 5))
            .await
            .unwrap();
        store
            .publish(&ProgressUpdate::downloading("ep-1", 41))
            .await
            .unwrap();

        let second = updates.next().await.unwrap();
        assert_eq!(second.content_id, "ep-1");
        assert_eq!(second.progress, 41);
    }

    #[tokio::test]
    async fn test_observe_waits_for_missing_record() {
        let store = store();
        let mut updates = store.observe("ep-9");

        let writer = store.clone();
        tokio::spawn(async move {
            writer
                .create_if_absent(&DownloadRecord::queued("ep-9", 1))
                .await
                .unwrap();
        });

        let first = updates.next().await.unwrap();
        assert_eq!(first.status, DownloadStatus::Queued);
    }

    #[tokio::test]
    async fn test_observe_is_restartable() {
        let store = store();
        store
            .publish(&ProgressUpdate::paused("ep-1", 33))
            .await
            .unwrap();

        for _ in 0..2 {
            let mut updates = store.observe("ep-1");
            let snapshot = updates.next().await.unwrap();
            assert_eq!(snapshot.status, DownloadStatus::Paused);
            assert_eq!(snapshot.progress, 33);
        }
    }
}
