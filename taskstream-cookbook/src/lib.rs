//! Ready-made recipes ("cookbook") for taskstream: parallel file-tree operations.
//! Each recipe walks a directory with `walkdir`, fans the regular files out over a
//! [`WorkerPool`], and reports the first I/O failure that survived its retries.
//!
//! **Recipes:**
//! - [`Recipe::count_bytes`]: total size of every file under a directory
//! - [`Recipe::copy_tree`]: copy a directory tree into a destination, overwriting existing files
//! - [`Recipe::delete_tree`]: delete files in parallel, then the emptied directories bottom-up

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use taskstream::{
    BuildError, CloseError, ExecutionError, Failure, StreamError, TaskStream, WorkerPool,
};
use walkdir::WalkDir;

/// Errors returned by the recipes.
#[derive(Debug, thiserror::Error)]
pub enum RecipeError {
    #[error("'{0}' is not a directory")]
    NotADirectory(PathBuf),
    #[error("failed to walk directory tree: {0}")]
    Walk(#[from] walkdir::Error),
    /// An I/O failure, either while walking or from a file operation that exhausted its retries.
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Execution(ExecutionError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Close(#[from] CloseError),
}

impl From<ExecutionError> for RecipeError {
    fn from(err: ExecutionError) -> Self {
        match err.try_into_deferred::<io::Error>() {
            Ok(io) => RecipeError::Io(io),
            Err(other) => RecipeError::Execution(other),
        }
    }
}

impl From<StreamError<io::Error>> for RecipeError {
    fn from(err: StreamError<io::Error>) -> Self {
        match err {
            StreamError::Declared(io) => RecipeError::Io(io),
            StreamError::Execution(other) => other.into(),
        }
    }
}

/// Summary of a copy or delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transfer {
    pub files: usize,
    pub bytes: u64,
}

/// Every regular file under `dir`, in walk order.
pub fn regular_files(dir: &Path) -> Result<Vec<PathBuf>, RecipeError> {
    if !dir.is_dir() {
        return Err(RecipeError::NotADirectory(dir.to_path_buf()));
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Shared configuration for the recipes: the pool they run on and the per-file retry budget.
///
/// The pool is borrowed, never shut down by a recipe.
#[derive(Debug, Clone)]
pub struct Recipe {
    pool: WorkerPool,
    retries: i64,
}

impl Recipe {
    pub fn new(pool: WorkerPool) -> Self {
        Self { pool, retries: 0 }
    }

    /// Additional attempts per file after an I/O failure.
    pub fn retries(mut self, retries: i64) -> Self {
        self.retries = retries;
        self
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    fn stream(&self, files: Vec<PathBuf>) -> Result<TaskStream<PathBuf>, RecipeError> {
        Ok(TaskStream::builder(files).pool(self.pool.clone()).retries(self.retries).build()?)
    }

    /// Sum of the sizes of every regular file under `dir`.
    pub fn count_bytes(&self, dir: &Path) -> Result<u64, RecipeError> {
        let sizes = self.stream(regular_files(dir)?)?.try_map_joining(
            |file: &PathBuf| -> Result<u64, Failure<io::Error>> { Ok(fs::metadata(file)?.len()) },
        );
        let mut total = 0;
        for size in sizes {
            total += size?;
        }
        Ok(total)
    }

    /// Copy every regular file under `source` to the same relative path under `destination`.
    pub fn copy_tree(&self, source: &Path, destination: &Path) -> Result<Transfer, RecipeError> {
        let files = regular_files(source)?;
        let count = files.len();
        tracing::info!(source = %source.display(), files = count, "collecting files to copy");

        let bytes = Arc::new(AtomicU64::new(0));
        let copied = bytes.clone();
        let source_root = source.to_path_buf();
        let destination_root = destination.to_path_buf();

        let mut stream = self.stream(files)?;
        stream.try_for_each_parallel(move |file: &PathBuf| -> Result<(), Failure<io::Error>> {
            let n = copy_file(file, &source_root, &destination_root)?;
            copied.fetch_add(n, Ordering::Relaxed);
            Ok(())
        })?;
        stream.close()?;

        let transfer = Transfer { files: count, bytes: bytes.load(Ordering::Relaxed) };
        tracing::info!(files = transfer.files, bytes = transfer.bytes, "copy finished");
        Ok(transfer)
    }

    /// Delete `dir` and everything under it. Files go in parallel, directories afterwards.
    pub fn delete_tree(&self, dir: &Path) -> Result<Transfer, RecipeError> {
        let files = regular_files(dir)?;
        let count = files.len();
        tracing::info!(dir = %dir.display(), files = count, "collecting files to delete");

        let bytes = Arc::new(AtomicU64::new(0));
        let deleted = bytes.clone();
        let mut stream = self.stream(files)?;
        stream.try_for_each_parallel(move |file: &PathBuf| -> Result<(), Failure<io::Error>> {
            let size = fs::metadata(file)?.len();
            fs::remove_file(file)?;
            deleted.fetch_add(size, Ordering::Relaxed);
            Ok(())
        })?;
        stream.close()?;

        for entry in WalkDir::new(dir).contents_first(true) {
            let entry = entry?;
            if entry.file_type().is_dir() {
                fs::remove_dir(entry.path())?;
            } else {
                fs::remove_file(entry.path())?;
            }
        }

        Ok(Transfer { files: count, bytes: bytes.load(Ordering::Relaxed) })
    }
}

fn copy_file(file: &Path, source_root: &Path, destination_root: &Path) -> io::Result<u64> {
    let relative = file
        .strip_prefix(source_root)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
    let target = destination_root.join(relative);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(file, &target)
}
