use std::{
    fs::File,
    io,
    path::Path,
    sync::Arc,
};

use anyhow::Context;

use super::RawSource;
use crate::error::Error;

/// A local file read with positional reads, so any number of sources can
/// share one open handle without fighting over a cursor.
#[derive(Debug, Clone)]
pub struct FileSource {
    file: Arc<File>,
    path: String,
    pos: u64,
    len: u64,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let location = path.as_ref().display().to_string();
        let file = match File::open(path.as_ref()) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound { location }.into());
            }
            Err(e) => return Err(e).with_context(|| format!("opening {}", location)),
        };
        let len = file.metadata()?.len();
        Ok(Self::from_shared(Arc::new(file), location, len))
    }

    pub fn from_shared(file: Arc<File>, path: String, len: u64) -> Self {
        FileSource {
            file,
            path,
            pos: 0,
            len,
        }
    }
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

impl RawSource for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.len {
            return Ok(0);
        }
        let n = read_at(&self.file, buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn seek(&mut self, offset: u64) -> io::Result<()> {
        self.pos = offset;
        Ok(())
    }

    fn len(&mut self) -> io::Result<Option<u64>> {
        Ok(Some(self.len))
    }

    fn location(&self) -> &str {
        &self.path
    }
}
