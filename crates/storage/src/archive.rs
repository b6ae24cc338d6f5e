//! Directory archives.
//!
//! A persisted frame or column is a directory carrying a small descriptor
//! naming what lives inside, so callers can probe a URL before deciding how
//! to open it.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sfq_common::{Result, SfqError};

use crate::column::write_column_index;
use crate::sarray::SArray;

/// Descriptor file name at the root of every directory archive.
pub const ARCHIVE_DESCRIPTOR_FILE: &str = "dir_archive.json";

/// What a directory archive contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveKind {
    SArray,
    SFrame,
}

#[derive(Debug, Serialize, Deserialize)]
struct ArchiveDescriptor {
    version: u32,
    contents: ArchiveKind,
}

pub(crate) fn write_archive_descriptor(dir: &Path, kind: ArchiveKind) -> Result<()> {
    let text = serde_json::to_string_pretty(&ArchiveDescriptor {
        version: 1,
        contents: kind,
    })
    .map_err(|e| SfqError::Storage(format!("archive descriptor encode failed: {e}")))?;
    fs::write(dir.join(ARCHIVE_DESCRIPTOR_FILE), text)?;
    Ok(())
}

/// Is this path a directory archive written by this crate?
pub fn is_directory_archive(path: &Path) -> bool {
    path.is_dir() && path.join(ARCHIVE_DESCRIPTOR_FILE).is_file()
}

/// What kind of archive lives at this path.
pub fn archive_kind(path: &Path) -> Result<ArchiveKind> {
    let text = fs::read_to_string(path.join(ARCHIVE_DESCRIPTOR_FILE))?;
    let desc: ArchiveDescriptor = serde_json::from_str(&text)
        .map_err(|e| SfqError::Storage(format!("bad archive descriptor: {e}")))?;
    Ok(desc.contents)
}

/// Column index file name inside a standalone column archive.
pub const SARRAY_INDEX_FILE: &str = "array.sidx";

/// Persist a single column as a directory archive.
pub fn save_sarray(array: &SArray, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    let src_index = array.index();
    let src_dir = array.index_path().parent().expect("index path has parent");
    let mut index = src_index.clone();
    index.segment_files.clear();
    for (s, file) in src_index.segment_files.iter().enumerate() {
        let dst_name = format!("array_seg_{s:04}.bin");
        fs::copy(src_dir.join(file), dir.join(&dst_name))?;
        index.segment_files.push(dst_name);
    }
    write_column_index(&dir.join(SARRAY_INDEX_FILE), &index)?;
    write_archive_descriptor(dir, ArchiveKind::SArray)?;
    Ok(())
}

/// Open a standalone column archive.
pub fn open_sarray(dir: &Path) -> Result<SArray> {
    match archive_kind(dir)? {
        ArchiveKind::SArray => SArray::open(&dir.join(SARRAY_INDEX_FILE)),
        ArchiveKind::SFrame => Err(SfqError::Storage(format!(
            "{} holds a frame, not a column",
            dir.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sframe::SFrame;
    use sfq_common::{Cell, CellType};

    #[test]
    fn predicates_distinguish_archive_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("plain");
        fs::create_dir_all(&plain).unwrap();
        assert!(!is_directory_archive(&plain));

        let sa = SArray::from_cells(
            (0..4).map(Cell::Integer),
            CellType::Integer,
            2,
        )
        .unwrap();
        let col_dir = dir.path().join("col");
        save_sarray(&sa, &col_dir).unwrap();
        assert!(is_directory_archive(&col_dir));
        assert_eq!(archive_kind(&col_dir).unwrap(), ArchiveKind::SArray);

        let frame = SFrame::from_columns(vec![sa], vec!["x".into()]).unwrap();
        let frame_dir = dir.path().join("frame");
        frame.save(&frame_dir).unwrap();
        assert!(is_directory_archive(&frame_dir));
        assert_eq!(archive_kind(&frame_dir).unwrap(), ArchiveKind::SFrame);
    }

    #[test]
    fn sarray_archive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sa = SArray::from_cells(
            (0..6).map(Cell::Integer),
            CellType::Integer,
            3,
        )
        .unwrap();
        let target = dir.path().join("arr");
        save_sarray(&sa, &target).unwrap();
        let reopened = open_sarray(&target).unwrap();
        assert_eq!(reopened.to_vec().unwrap(), sa.to_vec().unwrap());
    }
}
