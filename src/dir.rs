//! File-naming helpers for the persisted state directory.
//!
//! Only naming/parsing is in scope here; recursively scanning a directory to rebuild a
//! registry on boot belongs to the outer bootstrapping layer, which is out of scope.

use std::path::{Path, PathBuf};

use crate::state_index::StateIndex;

const SNAPSHOT_LOG_NAME: &str = "snapshot.log";

pub fn log_file_name(id: StateIndex) -> String {
    format!("log-{id}")
}

pub fn snapshot_file_name(id: StateIndex) -> String {
    format!("snapshot-{id}")
}

pub fn merge_file_name(id: StateIndex) -> String {
    format!("merge-{id}")
}

pub fn fixed_file_name(delay: u64, id: StateIndex) -> String {
    format!("fixed-{delay}-{id}")
}

pub fn temporary_file_name(id: StateIndex) -> String {
    format!("tmp-{id}")
}

pub fn snapshot_log_path(dir: &Path) -> PathBuf {
    dir.join(SNAPSHOT_LOG_NAME)
}

/// Parses a `term-index` hex pair as produced by [`StateIndex`]'s `Display` impl.
pub fn parse_state_index_suffix(s: &str) -> Option<StateIndex> {
    let (term, index) = s.split_once('-')?;
    let term = u64::from_str_radix(term, 16).ok()?;
    let index = u64::from_str_radix(index, 16).ok()?;
    Some(StateIndex::new(term, index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_the_persisted_directory_scheme() {
        let id = StateIndex::new(1, 2);
        assert_eq!(log_file_name(id), format!("log-{id}"));
        assert_eq!(snapshot_file_name(id), format!("snapshot-{id}"));
        assert_eq!(merge_file_name(id), format!("merge-{id}"));
        assert_eq!(fixed_file_name(30, id), format!("fixed-30-{id}"));
        assert_eq!(temporary_file_name(id), format!("tmp-{id}"));
    }

    #[test]
    fn parses_state_index_suffix_round_trip() {
        let id = StateIndex::new(0xabc, 0xdef);
        let rendered = id.to_string();
        assert_eq!(parse_state_index_suffix(&rendered), Some(id));
    }
}
