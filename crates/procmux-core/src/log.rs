use parking_lot::Mutex;
use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::sync::Arc;

/// Log sink attached to a process. Every successful read and write on the
/// process is echoed here.
#[derive(Clone)]
pub struct ProcessLog {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
    file: Option<Arc<File>>,
}

impl ProcessLog {
    pub fn new(writer: Box<dyn Write + Send>) -> ProcessLog {
        ProcessLog {
            sink: Arc::new(Mutex::new(writer)),
            file: None,
        }
    }

    /// File-backed sink; the file can also serve as a detached child's stdout.
    pub fn from_file(file: File) -> io::Result<ProcessLog> {
        let handle = file.try_clone()?;
        Ok(ProcessLog {
            sink: Arc::new(Mutex::new(Box::new(file))),
            file: Some(Arc::new(handle)),
        })
    }

    pub fn write(&self, data: &[u8]) -> io::Result<()> {
        self.sink.lock().write_all(data)
    }

    pub fn flush(&self) -> io::Result<()> {
        self.sink.lock().flush()
    }

    /// A fresh descriptor for the backing file, if there is one
    pub fn child_stdio(&self) -> Option<io::Result<File>> {
        self.file.as_ref().map(|file| file.try_clone())
    }

    pub fn same_sink(&self, other: &ProcessLog) -> bool {
        Arc::ptr_eq(&self.sink, &other.sink)
    }
}

impl fmt::Debug for ProcessLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessLog")
            .field("file_backed", &self.file.is_some())
            .finish()
    }
}

/// Cloneable in-memory writer, handy as a log sink
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> SharedBuffer {
        SharedBuffer::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    pub fn into_log(self) -> ProcessLog {
        ProcessLog::new(Box::new(self))
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
