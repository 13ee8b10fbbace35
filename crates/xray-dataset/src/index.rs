//! Image-folder index.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use xray_core::Result;

/// Image file name to containing folder
#[derive(Debug, Clone, Default)]
pub struct ImageIndex {
    entries: HashMap<String, PathBuf>,
}

impl ImageIndex {
    /// Scan `folders` in order, indexing every `.png` file.
    ///
    /// Absent folders are skipped. When a file name appears in more than one
    /// folder the first folder scanned wins.
    pub fn build(folders: &[PathBuf]) -> Result<Self> {
        let mut entries: HashMap<String, PathBuf> = HashMap::new();
        let mut scanned = 0usize;

        for folder in folders {
            if !folder.is_dir() {
                debug!("Skipping missing image folder {}", folder.display());
                continue;
            }
            scanned += 1;

            let mut names = Vec::new();
            for entry in fs::read_dir(folder)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.ends_with(".png") {
                    names.push(name);
                }
            }
            names.sort();

            for name in names {
                entries.entry(name).or_insert_with(|| folder.clone());
            }
        }

        info!(
            "Indexed {} images across {} of {} folders",
            entries.len(),
            scanned,
            folders.len()
        );
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, image_id: &str) -> bool {
        self.entries.contains_key(image_id)
    }

    /// Folder holding `image_id`
    pub fn folder(&self, image_id: &str) -> Option<&Path> {
        self.entries.get(image_id).map(PathBuf::as_path)
    }

    /// Full path of `image_id`
    pub fn path(&self, image_id: &str) -> Option<PathBuf> {
        self.folder(image_id).map(|f| f.join(image_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_first_seen_wins_and_png_only() -> Result<()> {
        let dir = TempDir::new()?;
        let first = dir.path().join("images_001").join("images");
        let second = dir.path().join("images_002").join("images");
        fs::create_dir_all(&first)?;
        fs::create_dir_all(&second)?;
        fs::write(first.join("a.png"), b"")?;
        fs::write(second.join("a.png"), b"")?;
        fs::write(second.join("b.png"), b"")?;
        fs::write(second.join("notes.txt"), b"")?;

        let missing = dir.path().join("images_003").join("images");
        let index = ImageIndex::build(&[first.clone(), second.clone(), missing])?;

        assert_eq!(index.len(), 2);
        assert_eq!(index.folder("a.png"), Some(first.as_path()));
        assert_eq!(index.path("b.png"), Some(second.join("b.png")));
        assert!(!index.contains("notes.txt"));
        Ok(())
    }

    #[test]
    fn test_no_folders() -> Result<()> {
        let index = ImageIndex::build(&[])?;
        assert!(index.is_empty());
        Ok(())
    }
}
