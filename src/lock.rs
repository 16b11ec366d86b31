//! Exclusive ownership of a data root across processes.

use std::{
   fs::{self, File, OpenOptions},
   path::{Path, PathBuf},
};

use fs4::FileExt;

use crate::{Error, Result};

const LOCK_FILE: &str = "lock";

pub struct DataLock {
   file: File,
   path: PathBuf,
}

impl DataLock {
   /// Takes the lock without blocking; fails with [`Error::Locked`] when
   /// another engine already owns `root`.
   pub fn acquire(root: &Path) -> Result<Self> {
      fs::create_dir_all(root)?;
      let path = root.join(LOCK_FILE);
      let file = OpenOptions::new()
         .create(true)
         .truncate(false)
         .read(true)
         .write(true)
         .open(&path)?;
      match file.try_lock_exclusive() {
         Ok(()) => Ok(Self { file, path }),
         Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            Err(Error::Locked(root.to_path_buf()))
         },
         Err(e) => Err(e.into()),
      }
   }

   pub fn path(&self) -> &Path {
      &self.path
   }
}

impl Drop for DataLock {
   fn drop(&mut self) {
      let _ = FileExt::unlock(&self.file);
   }
}
