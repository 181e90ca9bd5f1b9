//! Train / validation / test partitioning of the processed corpus
//!
//! Files are sorted, shuffled with a seeded PCG generator and cut in two
//! steps: first the test share of the whole corpus, then the validation
//! share rescaled to what remains. Both cuts round up, so 10 files at
//! `test_size = 0.2`, `validation_size = 0.1` give 7 / 1 / 2.

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_pcg::Pcg64;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::files;

/// Partition label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Validation,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Validation, Split::Test];

    /// Directory name used on disk
    pub fn dir_name(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Validation => "validation",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Result of partitioning a list of items
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition<T> {
    pub train: Vec<T>,
    pub validation: Vec<T>,
    pub test: Vec<T>,
}

impl<T> Partition<T> {
    pub fn get(&self, split: Split) -> &[T] {
        match split {
            Split::Train => &self.train,
            Split::Validation => &self.validation,
            Split::Test => &self.test,
        }
    }

    pub fn len(&self) -> usize {
        self.train.len() + self.validation.len() + self.test.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shuffle `items` with `seed` and split them into three disjoint sets
pub fn partition<T>(mut items: Vec<T>, test_size: f64, validation_size: f64, seed: u64) -> Partition<T> {
    let mut rng = Pcg64::seed_from_u64(seed);
    items.shuffle(&mut rng);

    let total = items.len();
    let test_count = ceil_count(total as f64 * test_size).min(total);
    let test = items.split_off(total - test_count);

    let remaining = items.len();
    let relative = if test_size < 1.0 {
        validation_size / (1.0 - test_size)
    } else {
        0.0
    };
    let val_count = ceil_count(remaining as f64 * relative).min(remaining);
    let validation = items.split_off(remaining - val_count);

    Partition {
        train: items,
        validation,
        test,
    }
}

// Shaves float noise so 10 * 0.2 never rounds up to 3.
fn ceil_count(x: f64) -> usize {
    (x - 1e-9).ceil().max(0.0) as usize
}

/// Copies files from a flat directory into `train/`, `validation/`, `test/`
pub struct DataSplitter {
    input_dir: PathBuf,
    output_dir: PathBuf,
    test_size: f64,
    validation_size: f64,
    seed: u64,
}

impl DataSplitter {
    pub fn new(input_dir: &Path, output_dir: &Path, test_size: f64, validation_size: f64, seed: u64) -> Self {
        Self {
            input_dir: input_dir.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            test_size,
            validation_size,
            seed,
        }
    }

    pub fn split_data(&self) -> Result<Partition<PathBuf>> {
        let all_files = files::list_files(&self.input_dir, &[])?;
        info!(count = all_files.len(), dir = %self.input_dir.display(), "Found files to split");

        let parts = partition(all_files, self.test_size, self.validation_size, self.seed);
        if parts.is_empty() {
            warn!("No files found in the input directory. Nothing to split.");
            return Ok(parts);
        }

        info!(
            train = parts.train.len(),
            validation = parts.validation.len(),
            test = parts.test.len(),
            "Splitting complete"
        );

        for split in Split::ALL {
            let destination = self.output_dir.join(split.dir_name());
            copy_files(parts.get(split), &destination)?;
        }
        info!("File copying complete");
        Ok(parts)
    }
}

fn copy_files(sources: &[PathBuf], destination: &Path) -> Result<()> {
    std::fs::create_dir_all(destination)
        .with_context(|| format!("Failed to create {}", destination.display()))?;
    for file in sources {
        let target = destination.join(files::file_name(file));
        if let Err(e) = std::fs::copy(file, &target) {
            error!(file = %file.display(), error = %e, "Could not copy file");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ten_items_split_seven_one_two() {
        let parts = partition((0..10).collect(), 0.2, 0.1, 42);
        assert_eq!(parts.train.len(), 7);
        assert_eq!(parts.validation.len(), 1);
        assert_eq!(parts.test.len(), 2);
    }

    #[test]
    fn test_same_seed_same_partition() {
        let a = partition((0..57).collect::<Vec<u32>>(), 0.15, 0.15, 9);
        let b = partition((0..57).collect::<Vec<u32>>(), 0.15, 0.15, 9);
        assert_eq!(a, b);
    }

    #[test]
    fn test_partition_is_exhaustive_and_disjoint() {
        for n in [0usize, 1, 2, 3, 10, 99] {
            let parts = partition((0..n).collect(), 0.2, 0.1, 3);
            assert_eq!(parts.len(), n);
            let mut seen = HashSet::new();
            for split in Split::ALL {
                for item in parts.get(split) {
                    assert!(seen.insert(*item), "{item} appears twice");
                }
            }
            assert_eq!(seen.len(), n);
        }
    }

    #[test]
    fn test_split_data_copies_into_three_dirs() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        for i in 0..10 {
            std::fs::write(input.path().join(format!("{i:02}.png")), [i as u8]).unwrap();
        }

        let splitter = DataSplitter::new(input.path(), output.path(), 0.2, 0.1, 42);
        let parts = splitter.split_data().unwrap();

        let mut union = HashSet::new();
        for split in Split::ALL {
            let dir = output.path().join(split.dir_name());
            let copied = files::list_files(&dir, &[]).unwrap();
            assert_eq!(copied.len(), parts.get(split).len());
            for path in copied {
                assert!(union.insert(files::file_name(&path)));
            }
        }
        assert_eq!(union.len(), 10);

        let again = DataSplitter::new(input.path(), output.path(), 0.2, 0.1, 42)
            .split_data()
            .unwrap();
        assert_eq!(parts, again);
    }
}
