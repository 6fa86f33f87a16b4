use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use crate::constants::TMP_FILE_EXT;

pub fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(TMP_FILE_EXT);
    PathBuf::from(name)
}

pub fn fsync_dir(dir: &Path) -> io::Result<()> {
    let dirf = File::open(dir)?;
    dirf.sync_all()?;
    Ok(())
}

/// Replaces `path` with `contents`: written to a sibling temp file, fsynced, then renamed over
/// the live file. A reader sees either the old or the new contents, never a mix.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp = tmp_path_for(path);

    let res = (|| {
        let mut f = File::create(&tmp)?;
        f.write_all(contents)?;
        f.sync_all()?;
        drop(f);
        fs::rename(&tmp, path)
    })();

    if let Err(e) = res {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fsync_dir(parent)?;
    }

    Ok(())
}

/// Reads a whole file, mapping "does not exist" to `None`.
pub fn read_if_exists(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(buf) => Ok(Some(buf)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_atomic_replaces_and_leaves_no_tmp() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("states");

        write_atomic(&path, b"first")?;
        write_atomic(&path, b"second")?;

        assert_eq!(fs::read(&path)?, b"second");
        assert!(!tmp_path_for(&path).exists());
        Ok(())
    }

    #[test]
    fn read_if_exists_maps_missing_to_none() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        assert!(read_if_exists(&dir.path().join("nope"))?.is_none());
        Ok(())
    }
}
