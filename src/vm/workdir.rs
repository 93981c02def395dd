//! Per-instance temporary directories under the pool's working directory.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use uuid::Uuid;

use crate::vmimpl::VmError;

/// Creates `<workdir>/instance-<index>-<uuid>` and returns its path.
pub(crate) fn make_instance_dir(workdir: &Utf8Path, index: usize) -> Result<Utf8PathBuf, VmError> {
    Dir::create_ambient_dir_all(workdir, ambient_authority())
        .map_err(|err| VmError::io(format!("failed to create {workdir}"), &err))?;
    let root = Dir::open_ambient_dir(workdir, ambient_authority())
        .map_err(|err| VmError::io(format!("failed to open {workdir}"), &err))?;
    let name = format!("instance-{index}-{}", Uuid::new_v4().simple());
    root.create_dir(&name)
        .map_err(|err| VmError::io(format!("failed to create {workdir}/{name}"), &err))?;
    Ok(workdir.join(name))
}

/// Removes an instance directory and everything in it. A directory that is
/// already gone counts as removed.
pub(crate) fn remove_instance_dir(dir: &Utf8Path) -> Result<(), VmError> {
    let (Some(parent), Some(name)) = (dir.parent(), dir.file_name()) else {
        return Err(VmError::Config(format!("not an instance directory: {dir}")));
    };
    let result = Dir::open_ambient_dir(parent, ambient_authority())
        .and_then(|root| root.remove_dir_all(name));
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(VmError::io(format!("failed to remove {dir}"), &err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn utf8_root(temp: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).expect("utf8 temp dir")
    }

    #[test]
    fn instance_dirs_are_unique_and_removable() {
        let temp = TempDir::new().expect("temp dir");
        let root = utf8_root(&temp).join("pool");

        let first = make_instance_dir(&root, 3).expect("first dir");
        let second = make_instance_dir(&root, 3).expect("second dir");

        assert_ne!(first, second);
        assert!(first.file_name().is_some_and(|name| name.starts_with("instance-3-")));
        assert!(first.is_dir());

        remove_instance_dir(&first).expect("remove");
        assert!(!first.exists());
        assert!(second.is_dir());
    }

    #[test]
    fn removing_a_missing_dir_succeeds() {
        let temp = TempDir::new().expect("temp dir");
        let gone = utf8_root(&temp).join("instance-0-gone");

        assert_eq!(remove_instance_dir(&gone), Ok(()));
    }
}
