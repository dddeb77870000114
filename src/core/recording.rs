//! Module implementing recorder events and the sinks consuming them.
//!
//! Sinks are attached to a recording device and receive every event the device emits.
//! They accumulate events until the end of a run (`flush`) and release their resources
//! at cleanup (`close`).
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use itertools::Itertools;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::time::Step;
use crate::error::KernelError;

/// A timestamped event emitted by a recording device.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct RecorderEvent {
    /// The id of the node the event is about.
    pub sender: usize,
    /// The step of the event.
    pub step: Step,
    /// The time of the event, in ms.
    pub time: f64,
    /// Additional recorded values.
    pub payload: Vec<f64>,
}

impl RecorderEvent {
    pub fn new(sender: usize, step: Step, resolution: f64, payload: Vec<f64>) -> Self {
        RecorderEvent {
            sender,
            step,
            time: step as f64 * resolution,
            payload,
        }
    }

    fn to_line(&self) -> String {
        let mut fields = vec![self.sender.to_string(), format!("{:.3}", self.time)];
        fields.extend(self.payload.iter().map(|value| value.to_string()));
        fields.into_iter().join("\t")
    }
}

/// A consumer of recorder events.
pub trait RecordingSink: Send + fmt::Debug {
    /// The file backing the sink, if any.
    fn target_path(&self) -> Option<&Path> {
        None
    }

    /// Acquire the resources of the sink, before any simulation step.
    /// Must not alter existing data: that is deferred to `commit`.
    fn open(&mut self, _overwrite: bool) -> Result<(), KernelError> {
        Ok(())
    }

    /// Make a successful `open` final, once every sink of the process has opened.
    fn commit(&mut self) -> Result<(), KernelError> {
        Ok(())
    }

    /// Undo a successful `open` of the current preparation, before `commit`.
    fn abort(&mut self) {}

    /// Hand an event to the sink. Never blocks on I/O failures; these surface at `flush`.
    fn push(&mut self, event: &RecorderEvent);

    /// Make all events pushed so far visible.
    fn flush(&mut self) -> Result<(), KernelError> {
        Ok(())
    }

    /// Flush and release the resources of the sink.
    fn close(&mut self) -> Result<(), KernelError> {
        self.flush()
    }

    /// All events held by the sink, if it keeps them in memory.
    fn events(&self) -> Option<Vec<RecorderEvent>> {
        None
    }
}

/// Keeps events in memory. Clones share the same storage.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<RecorderEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        MemorySink::default()
    }

    /// Returns a copy of the events recorded so far.
    pub fn snapshot(&self) -> Vec<RecorderEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Drop the events recorded so far.
    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl RecordingSink for MemorySink {
    fn push(&mut self, event: &RecorderEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
    }

    fn events(&self) -> Option<Vec<RecorderEvent>> {
        Some(self.snapshot())
    }
}

/// Writes one tab-separated line per event to a file.
///
/// The first open creates the file and fails if it already exists, unless overwriting is
/// allowed. An overwritten file is only truncated at `commit`. Later opens (after a cleanup)
/// append to the file the sink owns.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    // The file was committed by an earlier preparation.
    owned: bool,
    // The pending open created the file from nothing.
    created_now: bool,
    // The pending open found an existing file to overwrite.
    truncate: bool,
    error: Option<String>,
}

impl FileSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FileSink {
            path: path.as_ref().to_path_buf(),
            writer: None,
            owned: false,
            created_now: false,
            truncate: false,
            error: None,
        }
    }
}

impl RecordingSink for FileSink {
    fn target_path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn open(&mut self, overwrite: bool) -> Result<(), KernelError> {
        if self.writer.is_some() {
            return Ok(());
        }
        let file = if self.owned {
            OpenOptions::new().append(true).open(&self.path)
        } else {
            match OpenOptions::new().write(true).create_new(true).open(&self.path) {
                Err(e) if e.kind() == ErrorKind::AlreadyExists && overwrite => {
                    let file = OpenOptions::new().write(true).open(&self.path);
                    self.truncate = file.is_ok();
                    file
                }
                Ok(file) => {
                    self.created_now = true;
                    Ok(file)
                }
                Err(e) => Err(e),
            }
        };
        let file = file.map_err(|e| {
            if e.kind() == ErrorKind::AlreadyExists {
                KernelError::SinkCollision(format!(
                    "{} already exists and overwriting is disabled",
                    self.path.display()
                ))
            } else {
                KernelError::IOError(format!("{}: {}", self.path.display(), e))
            }
        })?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn commit(&mut self) -> Result<(), KernelError> {
        let writer = match self.writer.as_mut() {
            Some(writer) => writer,
            None => return Ok(()),
        };
        if self.truncate {
            writer
                .get_mut()
                .set_len(0)
                .map_err(|e| KernelError::IOError(format!("{}: {}", self.path.display(), e)))?;
            self.truncate = false;
        }
        if !self.owned {
            info!("Recording to {}", self.path.display());
        }
        self.owned = true;
        self.created_now = false;
        Ok(())
    }

    fn abort(&mut self) {
        self.writer = None;
        self.truncate = false;
        if self.created_now {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!("Could not remove {}: {}", self.path.display(), e);
            }
            self.created_now = false;
        }
    }

    fn push(&mut self, event: &RecorderEvent) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writeln!(writer, "{}", event.to_line()) {
                self.error.get_or_insert(e.to_string());
            }
        } else {
            self.error
                .get_or_insert(format!("{} is not open", self.path.display()));
        }
    }

    fn flush(&mut self) -> Result<(), KernelError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        match self.error.take() {
            Some(e) => Err(KernelError::IOError(e)),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> Result<(), KernelError> {
        let result = self.flush();
        self.writer = None;
        result
    }
}

/// Prints events to the terminal at every flush.
#[derive(Debug, Default)]
pub struct ScreenSink {
    lines: Vec<String>,
}

impl ScreenSink {
    pub fn new() -> Self {
        ScreenSink::default()
    }
}

impl RecordingSink for ScreenSink {
    fn push(&mut self, event: &RecorderEvent) {
        self.lines.push(event.to_line());
    }

    fn flush(&mut self) -> Result<(), KernelError> {
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        for line in self.lines.drain(..) {
            writeln!(handle, "{}", line)?;
        }
        Ok(())
    }
}

/// The sinks attached to every recording device of a process.
#[derive(Debug, Default)]
pub struct RecordingManager {
    sinks: BTreeMap<usize, Vec<Box<dyn RecordingSink>>>,
}

impl RecordingManager {
    pub fn new() -> Self {
        RecordingManager::default()
    }

    /// Attach a sink to a device.
    pub fn attach(&mut self, device_id: usize, sink: Box<dyn RecordingSink>) {
        self.sinks.entry(device_id).or_default().push(sink);
    }

    /// Returns the number of sinks attached to a device.
    pub fn num_sinks(&self, device_id: usize) -> usize {
        self.sinks.get(&device_id).map_or(0, |sinks| sinks.len())
    }

    /// Open every sink. Either all sinks end up open, or none of the sinks opened by this
    /// call remains open, no file is left behind, and no existing file is altered.
    pub fn open_all(&mut self, overwrite: bool) -> Result<(), KernelError> {
        let mut paths = HashSet::new();
        for path in self.sinks.values().flatten().filter_map(|sink| sink.target_path()) {
            let path = normalize(path);
            if !paths.insert(path.clone()) {
                return Err(KernelError::SinkCollision(format!(
                    "several sinks write to {}",
                    path.display()
                )));
            }
        }

        let mut opened: Vec<(usize, usize)> = vec![];
        let mut failure = None;
        'outer: for (device_id, sinks) in self.sinks.iter_mut() {
            for (index, sink) in sinks.iter_mut().enumerate() {
                match sink.open(overwrite) {
                    Ok(()) => opened.push((*device_id, index)),
                    Err(e) => {
                        failure = Some(e);
                        break 'outer;
                    }
                }
            }
        }

        if failure.is_none() {
            for sink in self.sinks.values_mut().flatten() {
                if let Err(e) = sink.commit() {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            for (device_id, index) in opened {
                if let Some(sink) = self
                    .sinks
                    .get_mut(&device_id)
                    .and_then(|sinks| sinks.get_mut(index))
                {
                    sink.abort();
                }
            }
            return Err(e);
        }
        debug!("Opened {} recording sinks", self.sinks.values().flatten().count());
        Ok(())
    }

    /// Hand an event of a device to all its sinks. Devices without a sink get a memory sink.
    pub fn push(&mut self, device_id: usize, event: &RecorderEvent) {
        let sinks = self
            .sinks
            .entry(device_id)
            .or_insert_with(|| vec![Box::new(MemorySink::new())]);
        for sink in sinks.iter_mut() {
            sink.push(event);
        }
    }

    /// Flush every sink, reporting the first failure.
    pub fn flush_all(&mut self) -> Result<(), KernelError> {
        let mut result = Ok(());
        for sink in self.sinks.values_mut().flatten() {
            if let Err(e) = sink.flush() {
                result = result.and(Err(e));
            }
        }
        result
    }

    /// Close every sink, reporting the first failure.
    pub fn close_all(&mut self) -> Result<(), KernelError> {
        let mut result = Ok(());
        for sink in self.sinks.values_mut().flatten() {
            if let Err(e) = sink.close() {
                result = result.and(Err(e));
            }
        }
        result
    }

    /// All events of a device held in memory by its sinks.
    pub fn events(&self, device_id: usize) -> Vec<RecorderEvent> {
        self.sinks
            .get(&device_id)
            .map(|sinks| {
                sinks
                    .iter()
                    .filter_map(|sink| sink.events())
                    .next()
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }
}

/// Resolve a path as far as possible without requiring it to exist.
fn normalize(path: &Path) -> PathBuf {
    let parent = path.parent().filter(|parent| !parent.as_os_str().is_empty());
    match (parent.map(fs::canonicalize), path.file_name()) {
        (Some(Ok(parent)), Some(name)) => parent.join(name),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn event(sender: usize, step: Step) -> RecorderEvent {
        RecorderEvent::new(sender, step, 0.1, vec![])
    }

    #[test]
    fn test_memory_sink_shares_storage() {
        let sink = MemorySink::new();
        let mut manager = RecordingManager::new();
        manager.attach(7, Box::new(sink.clone()));
        manager.push(7, &event(1, 10));
        manager.push(7, &event(2, 12));

        assert_eq!(sink.snapshot(), vec![event(1, 10), event(2, 12)]);
        assert_eq!(manager.events(7), sink.snapshot());
        assert!(manager.events(8).is_empty());
    }

    #[test]
    fn test_default_memory_sink() {
        let mut manager = RecordingManager::new();
        manager.push(3, &event(1, 5));
        assert_eq!(manager.num_sinks(3), 1);
        assert_eq!(manager.events(3), vec![event(1, 5)]);
    }

    #[test]
    fn test_file_sink_writes_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("spikes.dat");
        let mut sink = FileSink::new(&path);
        sink.open(false).unwrap();
        sink.commit().unwrap();
        sink.push(&RecorderEvent::new(4, 15, 0.1, vec![0.5]));
        sink.close().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "4\t1.500\t0.5\n");

        // Reopening appends to the file created by the sink
        sink.open(false).unwrap();
        sink.commit().unwrap();
        sink.push(&event(5, 20));
        sink.close().unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn test_file_sink_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("spikes.dat");
        fs::write(&path, "precious").unwrap();

        let mut sink = FileSink::new(&path);
        assert!(matches!(
            sink.open(false),
            Err(KernelError::SinkCollision(_))
        ));
        assert_eq!(fs::read_to_string(&path).unwrap(), "precious");

        // Overwriting only truncates at commit
        sink.open(true).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "precious");
        sink.commit().unwrap();
        sink.close().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn test_open_all_detects_shared_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("spikes.dat");
        let mut manager = RecordingManager::new();
        manager.attach(1, Box::new(FileSink::new(&path)));
        manager.attach(2, Box::new(FileSink::new(&path)));

        assert!(matches!(
            manager.open_all(false),
            Err(KernelError::SinkCollision(_))
        ));
        assert!(!path.exists());
    }

    #[test]
    fn test_open_all_rolls_back() {
        let dir = tempdir().unwrap();
        let fresh = dir.path().join("a.dat");
        let existing = dir.path().join("b.dat");
        fs::write(&existing, "precious").unwrap();

        let mut manager = RecordingManager::new();
        manager.attach(1, Box::new(FileSink::new(&fresh)));
        manager.attach(2, Box::new(FileSink::new(&existing)));

        assert!(manager.open_all(false).is_err());
        assert!(!fresh.exists());
        assert_eq!(fs::read_to_string(&existing).unwrap(), "precious");
    }

    #[test]
    fn test_open_all_rolls_back_without_touching_overwritten_files() {
        let dir = tempdir().unwrap();
        let existing = dir.path().join("a.dat");
        let fresh = dir.path().join("c.dat");
        let unreachable = dir.path().join("missing").join("b.dat");
        fs::write(&existing, "precious").unwrap();

        let mut manager = RecordingManager::new();
        manager.attach(1, Box::new(FileSink::new(&existing)));
        manager.attach(2, Box::new(FileSink::new(&fresh)));
        manager.attach(3, Box::new(FileSink::new(&unreachable)));

        assert!(matches!(
            manager.open_all(true),
            Err(KernelError::IOError(_))
        ));
        assert_eq!(fs::read_to_string(&existing).unwrap(), "precious");
        assert!(!fresh.exists());
        assert!(!unreachable.exists());

        // Once every sink opens, the existing file is overwritten
        let mut manager = RecordingManager::new();
        manager.attach(1, Box::new(FileSink::new(&existing)));
        manager.attach(2, Box::new(FileSink::new(&fresh)));
        manager.open_all(true).unwrap();
        manager.push(1, &event(4, 15));
        manager.close_all().unwrap();
        assert_eq!(fs::read_to_string(&existing).unwrap(), "4\t1.500\n");
        assert_eq!(fs::read_to_string(&fresh).unwrap(), "");
    }
}
