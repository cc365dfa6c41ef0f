//! Iterative directory walk used for boot-time diagnostics.
//!
//! Pending directories live on a bounded stack instead of the call stack, so a
//! deeply nested card cannot exhaust the MCU stack. Directories that do not fit
//! on the stack (or exceed the path budget) are counted and skipped.

use heapless::{String, Vec};

use super::{DirEntry, EntryKind, Filesystem, FsError, MAX_PATH_LEN};

/// Maximum number of directories waiting to be visited.
pub const MAX_PENDING_DIRS: usize = 16;

/// Absolute path buffer used by the walker.
pub type PathBuf = String<MAX_PATH_LEN>;

/// Totals reported once the walk finishes.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct WalkSummary {
    pub entries: usize,
    pub skipped_dirs: usize,
}

/// Joins a directory path and an entry name.
pub fn join(parent: &str, name: &str) -> Result<PathBuf, FsError> {
    let mut path = PathBuf::new();
    path.push_str(parent).map_err(|_| FsError::NameTooLong)?;
    if !parent.ends_with('/') {
        path.push('/').map_err(|_| FsError::NameTooLong)?;
    }
    path.push_str(name).map_err(|_| FsError::NameTooLong)?;
    Ok(path)
}

/// Visits every entry below `root`, descending at most `max_depth` levels.
///
/// `visit` receives the absolute path of each entry. A depth of `1` lists only
/// the immediate children of `root`.
pub fn walk<F>(
    fs: &mut F,
    root: &str,
    max_depth: u8,
    visit: &mut dyn FnMut(&str, &DirEntry),
) -> Result<WalkSummary, FsError>
where
    F: Filesystem,
{
    let mut summary = WalkSummary::default();
    if max_depth == 0 {
        return Ok(summary);
    }

    let mut pending: Vec<(PathBuf, u8), MAX_PENDING_DIRS> = Vec::new();
    let root = PathBuf::try_from(root).map_err(|_| FsError::NameTooLong)?;
    // Capacity is at least one, the first push cannot fail.
    let _ = pending.push((root, 1));

    while let Some((dir, depth)) = pending.pop() {
        fs.for_each_entry(&dir, &mut |entry| {
            summary.entries += 1;
            match join(&dir, &entry.name) {
                Ok(path) => {
                    visit(&path, entry);
                    if entry.kind == EntryKind::Directory
                        && depth < max_depth
                        && pending.push((path, depth + 1)).is_err()
                    {
                        summary.skipped_dirs += 1;
                    }
                }
                Err(_) => {
                    if entry.kind == EntryKind::Directory {
                        summary.skipped_dirs += 1;
                    }
                }
            }
        })?;
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Metadata;

    /// Fixed tree: `/a`, `/a/b`, `/a/b/c.bin`, `/top.txt`.
    struct TreeFs;

    impl Filesystem for TreeFs {
        type File = ();

        fn metadata(&mut self, _: &str) -> Result<Metadata, FsError> {
            Err(FsError::NotFound)
        }

        fn create(&mut self, _: &str) -> Result<(), FsError> {
            Err(FsError::Io)
        }

        fn open(&mut self, _: &str) -> Result<(), FsError> {
            Err(FsError::Io)
        }

        fn read(&mut self, _: &mut (), _: &mut [u8]) -> Result<usize, FsError> {
            Ok(0)
        }

        fn write(&mut self, _: &mut (), _: &[u8]) -> Result<(), FsError> {
            Err(FsError::Io)
        }

        fn close(&mut self, _: ()) -> Result<(), FsError> {
            Ok(())
        }

        fn rename(&mut self, _: &str, _: &str) -> Result<(), FsError> {
            Err(FsError::Io)
        }

        fn remove(&mut self, _: &str) -> Result<(), FsError> {
            Err(FsError::Io)
        }

        fn create_dir(&mut self, _: &str) -> Result<(), FsError> {
            Err(FsError::Io)
        }

        fn for_each_entry(
            &mut self,
            dir: &str,
            visit: &mut dyn FnMut(&DirEntry),
        ) -> Result<(), FsError> {
            let entries: &[(&str, EntryKind)] = match dir {
                "/" => &[("a", EntryKind::Directory), ("top.txt", EntryKind::File)],
                "/a" => &[("b", EntryKind::Directory)],
                "/a/b" => &[("c.bin", EntryKind::File)],
                _ => return Err(FsError::NotFound),
            };
            for (name, kind) in entries {
                visit(&DirEntry::new(name, *kind, 0)?);
            }
            Ok(())
        }
    }

    #[test]
    fn join_handles_root_and_nested_parents() {
        assert_eq!(join("/", "boot_cnt").unwrap().as_str(), "/boot_cnt");
        assert_eq!(
            join("/firmware", "update.bin").unwrap().as_str(),
            "/firmware/update.bin"
        );
    }

    #[test]
    fn depth_one_lists_only_root_children() {
        let mut seen: Vec<PathBuf, 8> = Vec::new();
        let summary = walk(&mut TreeFs, "/", 1, &mut |path, _| {
            seen.push(PathBuf::try_from(path).unwrap()).unwrap();
        })
        .unwrap();

        assert_eq!(summary.entries, 2);
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().any(|path| path.as_str() == "/a"));
        assert!(seen.iter().any(|path| path.as_str() == "/top.txt"));
    }

    #[test]
    fn deeper_walk_reaches_nested_files() {
        let mut seen: Vec<PathBuf, 8> = Vec::new();
        let summary = walk(&mut TreeFs, "/", 8, &mut |path, _| {
            seen.push(PathBuf::try_from(path).unwrap()).unwrap();
        })
        .unwrap();

        assert_eq!(summary.entries, 4);
        assert_eq!(summary.skipped_dirs, 0);
        assert!(seen.iter().any(|path| path.as_str() == "/a/b/c.bin"));
    }

    #[test]
    fn zero_depth_skips_the_walk() {
        let summary = walk(&mut TreeFs, "/", 0, &mut |_, _| panic!("unexpected visit")).unwrap();
        assert_eq!(summary, WalkSummary::default());
    }
}
