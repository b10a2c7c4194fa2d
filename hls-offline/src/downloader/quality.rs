//! Quality discovery.
//!
//! Lists the video renditions a manifest offers so a caller can pick one
//! before starting a download. Renditions are deduplicated by height and
//! returned lowest quality first.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::engine::{ManifestPreparer, PreparedManifest};
use super::stream_key::StreamKey;
use crate::{Error, Result};

/// One selectable quality variant of an asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rendition {
    /// Vertical resolution in pixels, always positive.
    pub height: u32,
    /// Declared bitrate in bits per second.
    pub bitrate: Option<u32>,
    /// Human readable label, e.g. `720p`.
    pub label: String,
    pub stream_key: StreamKey,
}

impl Rendition {
    fn new(height: u32, bitrate: Option<u32>, stream_key: StreamKey) -> Self {
        Self {
            height,
            bitrate,
            label: format!("{height}p"),
            stream_key,
        }
    }
}

/// Releases the prepared manifest when dropped.
struct ManifestGuard {
    manifest: Box<dyn PreparedManifest>,
}

impl Drop for ManifestGuard {
    fn drop(&mut self) {
        self.manifest.release();
    }
}

/// Discover the renditions offered by `manifest_url`.
///
/// Dropping the returned future cancels discovery; a manifest that was
/// already prepared is released in every case.
pub async fn discover_qualities(
    preparer: &dyn ManifestPreparer,
    manifest_url: &str,
) -> Result<Vec<Rendition>> {
    let manifest = preparer
        .prepare(manifest_url)
        .await
        .map_err(|source| Error::Preparation {
            url: manifest_url.to_string(),
            source,
        })?;
    let guard = ManifestGuard { manifest };

    let renditions = collect_renditions(guard.manifest.as_ref());
    debug!(
        url = %manifest_url,
        count = renditions.len(),
        "Discovered renditions"
    );
    Ok(renditions)
}

/// Enumerate, deduplicate by height and sort ascending.
fn collect_renditions(manifest: &dyn PreparedManifest) -> Vec<Rendition> {
    let mut seen_heights = HashSet::new();
    let mut renditions = Vec::new();

    for period_index in 0..manifest.period_count() {
        for (group_index, group) in manifest.track_groups(period_index).iter().enumerate() {
            for (track_index, format) in group.tracks.iter().enumerate() {
                let Some(height) = format.height.filter(|h| *h > 0) else {
                    continue;
                };
                if !seen_heights.insert(height) {
                    continue;
                }
                renditions.push(Rendition::new(
                    height,
                    format.bitrate,
                    StreamKey::new(period_index as u32, group_index as u32, track_index as u32),
                ));
            }
        }
    }

    // Stable sort: heights are unique at this point anyway.
    renditions.sort_by_key(|r| r.height);
    renditions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::engine::{EngineError, TrackFormat, TrackGroup};
    use crate::testing::{StaticManifest, StaticManifestPreparer};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_dedup_and_sort_by_height() {
        let preparer = StaticManifestPreparer::new(StaticManifest::from_heights(&[&[
            360, 720, 480, 720, 1080,
        ]]));

        let renditions = discover_qualities(&preparer, "https://cdn.example/master.m3u8")
            .await
            .unwrap();

        let heights: Vec<u32> = renditions.iter().map(|r| r.height).collect();
        assert_eq!(heights, vec![360, 480, 720, 1080]);
        let labels: Vec<&str> = renditions.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["360p", "480p", "720p", "1080p"]);
    }

    #[tokio::test]
    async fn test_first_seen_duplicate_wins() {
        let preparer = StaticManifestPreparer::new(StaticManifest::from_heights(&[&[
            360, 720, 480, 720, 1080,
        ]]));

        let renditions = discover_qualities(&preparer, "https://cdn.example/master.m3u8")
            .await
            .unwrap();

        let hd = renditions.iter().find(|r| r.height == 720).unwrap();
        assert_eq!(hd.stream_key, StreamKey::new(0, 0, 1));
    }

    #[tokio::test]
    async fn test_tracks_without_height_are_skipped() {
        let manifest = StaticManifest::new(vec![vec![
            TrackGroup::new(vec![TrackFormat::video(1280, 720, 2_500_000)]),
            TrackGroup::new(vec![
                TrackFormat::audio(128_000),
                TrackFormat {
                    height: Some(0),
                    ..TrackFormat::default()
                },
            ]),
        ]]);
        let preparer = StaticManifestPreparer::new(manifest);

        let renditions = discover_qualities(&preparer, "https://cdn.example/master.m3u8")
            .await
            .unwrap();
        assert_eq!(renditions.len(), 1);
        assert_eq!(renditions[0].bitrate, Some(2_500_000));
    }

    #[tokio::test]
    async fn test_stream_keys_span_periods_and_groups() {
        let manifest = StaticManifest::new(vec![
            vec![TrackGroup::new(vec![TrackFormat::video(640, 360, 800_000)])],
            vec![
                TrackGroup::new(vec![TrackFormat::audio(96_000)]),
                TrackGroup::new(vec![
                    TrackFormat::video(854, 480, 1_200_000),
                    TrackFormat::video(1920, 1080, 5_000_000),
                ]),
            ],
        ]);
        let preparer = StaticManifestPreparer::new(manifest);

        let renditions = discover_qualities(&preparer, "https://cdn.example/master.m3u8")
            .await
            .unwrap();
        let keys: Vec<StreamKey> = renditions.iter().map(|r| r.stream_key).collect();
        assert_eq!(
            keys,
            vec![
                StreamKey::new(0, 0, 0),
                StreamKey::new(1, 1, 0),
                StreamKey::new(1, 1, 1),
            ]
        );
    }

    #[tokio::test]
    async fn test_manifest_is_released_after_discovery() {
        let releases = Arc::new(AtomicUsize::new(0));
        let preparer = StaticManifestPreparer::new(
            StaticManifest::from_heights(&[&[720]]).with_release_counter(releases.clone()),
        );

        discover_qualities(&preparer, "https://cdn.example/master.m3u8")
            .await
            .unwrap();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_preparation_failure() {
        let preparer = StaticManifestPreparer::failing(EngineError::manifest("not a playlist"));

        let err = discover_qualities(&preparer, "https://cdn.example/broken.m3u8")
            .await
            .unwrap_err();
        match err {
            Error::Preparation { url, source } => {
                assert_eq!(url, "https://cdn.example/broken.m3u8");
                assert!(matches!(source, EngineError::Manifest { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_manifest_yields_nothing() {
        let preparer = StaticManifestPreparer::new(StaticManifest::new(vec![]));
        let renditions = discover_qualities(&preparer, "https://cdn.example/master.m3u8")
            .await
            .unwrap();
        assert!(renditions.is_empty());
    }
}
