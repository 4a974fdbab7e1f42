use std::path::{Path, PathBuf};

/// Resolves `path` against the current working directory.
/// If the working directory cannot be determined, the path is returned unchanged.
pub fn absolute_path(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path,
        }
    }
}

/// Returns the first path of `candidates` that points to an existing file.
pub fn first_existing_file<'a>(candidates: impl IntoIterator<Item = &'a Path>) -> Option<&'a Path> {
    candidates.into_iter().find(|path| path.is_file())
}
