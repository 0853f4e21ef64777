//! File/code adapted from https://github.com/jamjamjon/usls
//!
//! Directories the crate reads from and writes to: the user's cache for
//! pretrained weights and the current directory for training output.
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum FsAccess {
    Cache,
    Current,
}

impl FsAccess {
    /// Training output directory, relative to the current directory unless absolute.
    pub fn save_out(out: &Path) -> anyhow::Result<PathBuf> {
        if out.is_absolute() {
            std::fs::create_dir_all(out)?;
            return Ok(out.to_path_buf());
        }
        let subs: Vec<&str> = out.iter().filter_map(|s| s.to_str()).collect();
        Self::Current.raw_path_with_subs(&subs)
    }

    /// Where named pretrained weights are looked up: `~/.cache/rcnn_detect/models`.
    pub fn models_dir() -> anyhow::Result<PathBuf> {
        Self::Cache.path_with_subs(&["models"])
    }

    /// Base directory, with the `rcnn_detect` subdirectory unless `raw`.
    fn get_path(&self, raw: bool) -> anyhow::Result<PathBuf> {
        let base_path = match self {
            FsAccess::Cache => dirs::cache_dir(),
            FsAccess::Current => std::env::current_dir().ok(),
        };
        let mut path = base_path.ok_or_else(|| anyhow::anyhow!("No {self:?} directory on this system"))?;
        if !raw {
            path.push("rcnn_detect");
        }
        Ok(path)
    }

    /// `{base}/rcnn_detect/{subs..}`, created if missing.
    pub fn path_with_subs(&self, subs: &[&str]) -> anyhow::Result<PathBuf> {
        let mut d = self.get_path(false)?;
        self.append_subs(&mut d, subs)?;
        Ok(d)
    }

    /// `{base}/{subs..}`, created if missing.
    pub fn raw_path_with_subs(&self, subs: &[&str]) -> anyhow::Result<PathBuf> {
        let mut d = self.get_path(true)?;
        self.append_subs(&mut d, subs)?;
        Ok(d)
    }

    fn append_subs(&self, path: &mut PathBuf, subs: &[&str]) -> anyhow::Result<()> {
        for sub in subs {
            path.push(sub);
        }
        if !path.exists() {
            std::fs::create_dir_all(&path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_output_directory_is_created_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("result").join("run1");
        assert_eq!(FsAccess::save_out(&out).unwrap(), out);
        assert!(out.is_dir());
    }
}
