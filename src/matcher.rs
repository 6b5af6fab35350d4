use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

pub const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "webp", "gif"];
pub const MAX_IMAGES: usize = 4;

/// Outcome of an image lookup. `NotFound` tells the caller to fall back to the
/// placeholder (new products) or leave images untouched (duplicates).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageMatch {
    Found(Vec<PathBuf>),
    NotFound,
}

impl ImageMatch {
    pub fn paths(&self) -> &[PathBuf] {
        match self {
            ImageMatch::Found(paths) => paths,
            ImageMatch::NotFound => &[],
        }
    }
}

/// File-name index over an extracted image directory, built once per run.
#[derive(Debug, Default, Clone)]
pub struct ImageIndex {
    exact: HashMap<String, PathBuf>,
    folded: HashMap<String, PathBuf>,
}

impl ImageIndex {
    /// Walks `dir` recursively, keeping image files only. Unreadable entries
    /// are ignored.
    pub fn scan(dir: &Path) -> Self {
        let mut files = Vec::new();
        collect_files(dir, &mut files);
        // deterministic winner when two folders hold the same name
        files.sort();
        let mut index = Self::default();
        for path in files {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            index
                .exact
                .entry(name.to_string())
                .or_insert_with(|| path.clone());
            index.folded.entry(name.to_lowercase()).or_insert(path);
        }
        index
    }

    pub fn len(&self) -> usize {
        self.exact.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }

    /// Slots are primary (`M` then `M_0`), `M_1`, `M_2`, `M_3`. Each slot takes
    /// the first extension hit with the exact spelling, then falls back to a
    /// case-insensitive sweep.
    pub fn find_images(&self, model_id: &str) -> ImageMatch {
        let model_id = model_id.trim();
        if model_id.is_empty() {
            return ImageMatch::NotFound;
        }
        let primary = self
            .lookup(model_id)
            .or_else(|| self.lookup(&format!("{model_id}_0")));
        let mut found: Vec<PathBuf> = primary.into_iter().collect();
        for position in 1..MAX_IMAGES {
            if let Some(path) = self.lookup(&format!("{model_id}_{position}")) {
                found.push(path);
            }
        }
        found.truncate(MAX_IMAGES);
        if found.is_empty() {
            ImageMatch::NotFound
        } else {
            ImageMatch::Found(found)
        }
    }

    fn lookup(&self, stem: &str) -> Option<PathBuf> {
        IMAGE_EXTENSIONS
            .iter()
            .find_map(|ext| self.exact.get(&format!("{stem}.{ext}")))
            .or_else(|| {
                let stem = stem.to_lowercase();
                IMAGE_EXTENSIONS
                    .iter()
                    .find_map(|ext| self.folded.get(&format!("{stem}.{ext}")))
            })
            .cloned()
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        match entry.file_type() {
            Ok(kind) if kind.is_dir() => collect_files(&path, out),
            Ok(kind) if kind.is_file() && is_image(&path) => out.push(path),
            _ => {}
        }
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn find_images(model_id: &str, dir: &Path) -> ImageMatch {
        ImageIndex::scan(dir).find_images(model_id)
    }

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, b"img").unwrap();
        path
    }

    #[test]
    fn primary_then_numbered_images_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = touch(dir.path(), "M1.jpg");
        let b = touch(dir.path(), "M1_1.png");
        let c = touch(dir.path(), "M1_2.webp");
        touch(dir.path(), "M10.jpg");
        assert_eq!(find_images("M1", dir.path()), ImageMatch::Found(vec![a, b, c]));
    }

    #[test]
    fn nothing_matching_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "other.jpg");
        touch(dir.path(), "M1.txt");
        assert_eq!(find_images("M1", dir.path()), ImageMatch::NotFound);
    }

    #[test]
    fn underscore_zero_is_primary_only_without_plain_name() {
        let dir = tempfile::tempdir().unwrap();
        let zero = touch(dir.path(), "M2_0.png");
        let one = touch(dir.path(), "M2_1.jpg");
        assert_eq!(
            find_images("M2", dir.path()),
            ImageMatch::Found(vec![zero, one.clone()])
        );
        let plain = touch(dir.path(), "M2.gif");
        assert_eq!(
            find_images("M2", dir.path()),
            ImageMatch::Found(vec![plain, one])
        );
    }

    #[test]
    fn extension_precedence_follows_list_order() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "M3.png");
        let jpg = touch(dir.path(), "M3.jpg");
        assert_eq!(find_images("M3", dir.path()), ImageMatch::Found(vec![jpg]));
    }

    #[test]
    fn case_variants_are_caught_by_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let primary = touch(dir.path(), "rb3025.JPG");
        let extra = touch(dir.path(), "nested/Rb3025_3.Png");
        assert_eq!(
            find_images("RB3025", dir.path()),
            ImageMatch::Found(vec![primary, extra])
        );
    }

    #[test]
    fn capped_at_four() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["X.jpg", "X_1.jpg", "X_2.jpg", "X_3.jpg", "X_4.jpg"] {
            touch(dir.path(), name);
        }
        let found = find_images("X", dir.path());
        assert_eq!(found.paths().len(), MAX_IMAGES);
        assert!(found.paths().iter().all(|p| !p.ends_with("X_4.jpg")));
    }

    #[test]
    fn missing_directory_is_not_found() {
        assert_eq!(
            find_images("M1", Path::new("/definitely/not/here")),
            ImageMatch::NotFound
        );
    }

    #[test]
    fn index_skips_non_image_files() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "notes.txt");
        touch(dir.path(), "M1.pdf");
        let index = ImageIndex::scan(dir.path());
        assert!(index.is_empty());
        touch(dir.path(), "M1.JPEG");
        assert_eq!(ImageIndex::scan(dir.path()).len(), 1);
    }
}
