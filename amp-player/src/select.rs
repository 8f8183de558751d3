//! Track selection over the streams discovered in a source.
//!
//! Keeps the per-kind stream lists and the active choice for each kind.
//! Defaults to the first discovered stream of a kind; switching is a
//! membership-validated update and the caller drives the pipeline
//! restart.

use crate::error::{PlayerError, Result};
use crate::traits::{MediaInfo, MediaKind, StreamInfo};

/// Per-kind stream inventory and active selection.
#[derive(Debug, Default)]
pub struct StreamSelector {
    streams: Vec<StreamInfo>,
    active: [Option<u32>; 3],
}

fn slot(kind: MediaKind) -> usize {
    match kind {
        MediaKind::Video => 0,
        MediaKind::Audio => 1,
        MediaKind::Subtitle => 2,
    }
}

impl StreamSelector {
    /// Build a selector from discovered media info, activating the first
    /// stream of each kind.
    pub fn from_info(info: &MediaInfo) -> Self {
        let mut selector = Self {
            streams: info.streams.clone(),
            active: [None; 3],
        };
        for kind in MediaKind::ALL {
            selector.active[slot(kind)] =
                info.default_stream(kind).map(|s| s.index);
        }
        selector
    }

    /// All discovered streams of `kind`, in container order.
    pub fn available(&self, kind: MediaKind) -> Vec<StreamInfo> {
        self.streams
            .iter()
            .filter(|s| s.kind == kind)
            .cloned()
            .collect()
    }

    /// The active stream of `kind`, if the source has one.
    pub fn active(&self, kind: MediaKind) -> Option<&StreamInfo> {
        let index = self.active[slot(kind)]?;
        self.streams.iter().find(|s| s.index == index)
    }

    /// Indices of every active stream, for route setup.
    pub fn active_indices(&self) -> Vec<u32> {
        self.active.iter().flatten().copied().collect()
    }

    /// Activate the stream at `index` for `kind`. The stream must exist
    /// and be of the requested kind. Returns the previously active
    /// stream index so the caller can detect a same-stream no-op.
    pub fn select(&mut self, kind: MediaKind, index: u32) -> Result<Option<u32>> {
        let found = self
            .streams
            .iter()
            .find(|s| s.index == index)
            .ok_or_else(|| {
                PlayerError::InvalidStream(format!("no stream with index {index}"))
            })?;
        if found.kind != kind {
            return Err(PlayerError::InvalidStream(format!(
                "stream {index} is {}, not {kind}",
                found.kind
            )));
        }
        Ok(self.active[slot(kind)].replace(index))
    }

    /// Deactivate the stream of `kind`, if any. Returns the previously
    /// active index.
    pub fn deselect(&mut self, kind: MediaKind) -> Option<u32> {
        self.active[slot(kind)].take()
    }

    /// True when `index` is currently the active stream of its kind.
    pub fn is_active(&self, index: u32) -> bool {
        self.active.iter().any(|a| *a == Some(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_track_info() -> MediaInfo {
        MediaInfo {
            streams: vec![
                StreamInfo::new(0, MediaKind::Video, "h264").with_frame_rate(25.0),
                StreamInfo::new(1, MediaKind::Audio, "aac").with_language("eng"),
                StreamInfo::new(2, MediaKind::Audio, "aac").with_language("fra"),
            ],
            duration: Some(std::time::Duration::from_secs(10)),
            seekable: true,
        }
    }

    #[test]
    fn defaults_to_first_stream_of_each_kind() {
        let selector = StreamSelector::from_info(&two_track_info());
        assert_eq!(selector.active(MediaKind::Video).map(|s| s.index), Some(0));
        assert_eq!(selector.active(MediaKind::Audio).map(|s| s.index), Some(1));
        assert!(selector.active(MediaKind::Subtitle).is_none());
        assert_eq!(selector.active_indices(), vec![0, 1]);
    }

    #[test]
    fn select_switches_within_kind() {
        let mut selector = StreamSelector::from_info(&two_track_info());
        let previous = selector.select(MediaKind::Audio, 2).unwrap();
        assert_eq!(previous, Some(1));
        assert_eq!(
            selector.active(MediaKind::Audio).and_then(|s| s.language.clone()),
            Some("fra".to_string())
        );
    }

    #[test]
    fn select_rejects_unknown_index_and_kind_mismatch() {
        let mut selector = StreamSelector::from_info(&two_track_info());
        assert!(matches!(
            selector.select(MediaKind::Audio, 9),
            Err(PlayerError::InvalidStream(_))
        ));
        assert!(matches!(
            selector.select(MediaKind::Video, 1),
            Err(PlayerError::InvalidStream(_))
        ));
        // Selection untouched by the failed calls.
        assert_eq!(selector.active(MediaKind::Audio).map(|s| s.index), Some(1));
    }

    #[test]
    fn deselect_clears_the_kind() {
        let mut selector = StreamSelector::from_info(&two_track_info());
        assert_eq!(selector.deselect(MediaKind::Audio), Some(1));
        assert!(selector.active(MediaKind::Audio).is_none());
        assert!(!selector.is_active(1));
    }
}
