//! In-process coverage store and the coverage data file format.
//!
//! Instrumented code registers one [`ClassCoverage`] per class and flips
//! its hit flags directly. The store only guards the class map; flag
//! updates are lock-free.
//!
//! A coverage file is `["CVRT"][snapshot bytes]`, always written to
//! a temporary sibling and renamed into place.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use covrt_proto::{ClassRecord, CoverageSnapshot};

use crate::{Error, Result};

/// Leading bytes of every coverage data file.
pub const FILE_MAGIC: &[u8; 4] = b"CVRT";

/// Hit flags for one instrumented class.
#[derive(Debug)]
pub struct ClassCoverage {
    name: String,
    stamp: i64,
    methods: Box<[Box<[AtomicBool]>]>,
}

impl ClassCoverage {
    /// Creates zeroed flags for a class with the given block count per
    /// method.
    pub fn new(name: impl Into<String>, stamp: i64, method_blocks: &[usize]) -> Self {
        let methods = method_blocks
            .iter()
            .map(|&n| (0..n).map(|_| AtomicBool::new(false)).collect())
            .collect();
        Self {
            name: name.into(),
            stamp,
            methods,
        }
    }

    /// Fully qualified class name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instrumentation stamp.
    pub const fn stamp(&self) -> i64 {
        self.stamp
    }

    /// Marks a block as executed. Out-of-range indices are ignored.
    pub fn hit(&self, method: usize, block: usize) {
        if let Some(flag) = self.methods.get(method).and_then(|m| m.get(block)) {
            flag.store(true, Ordering::Relaxed);
        }
    }

    /// Clears every flag.
    pub fn reset(&self) {
        for flag in self.methods.iter().flatten() {
            flag.store(false, Ordering::Relaxed);
        }
    }

    /// Copies the current flags out.
    pub fn record(&self) -> ClassRecord {
        ClassRecord {
            stamp: self.stamp,
            blocks: self
                .methods
                .iter()
                .map(|m| m.iter().map(|f| f.load(Ordering::Relaxed)).collect())
                .collect(),
        }
    }
}

type ClassMap = BTreeMap<String, Arc<ClassCoverage>>;

/// Registry of instrumented classes.
#[derive(Debug, Default)]
pub struct CoverageData {
    classes: Mutex<ClassMap>,
}

impl CoverageData {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `class`, replacing any previous entry of the same name.
    pub fn add_class(&self, class: ClassCoverage) -> Arc<ClassCoverage> {
        let class = Arc::new(class);
        self.lock()
            .0
            .insert(class.name.clone(), Arc::clone(&class));
        class
    }

    /// Looks up a registered class.
    pub fn class(&self, name: &str) -> Option<Arc<ClassCoverage>> {
        self.lock().0.get(name).cloned()
    }

    /// Number of registered classes.
    pub fn size(&self) -> usize {
        self.lock().size()
    }

    /// Returns `true` if no class is registered.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Clears every class's flags in place.
    pub fn reset(&self) {
        self.lock().reset();
    }

    /// Locks the class map; new registrations block until the guard drops.
    pub fn lock(&self) -> CoverageGuard<'_> {
        CoverageGuard(self.classes.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Copies the class map, sharing the per-class flags.
    ///
    /// The copy is unaffected by later registrations but still sees hits
    /// and resets on classes it already contains.
    pub fn shallow_copy(&self) -> Self {
        Self {
            classes: Mutex::new(self.lock().0.clone()),
        }
    }

    /// Owned view of the current flags.
    pub fn snapshot(&self) -> CoverageSnapshot {
        self.lock().snapshot()
    }
}

/// Exclusive access to a [`CoverageData`] class map.
#[derive(Debug)]
pub struct CoverageGuard<'a>(MutexGuard<'a, ClassMap>);

impl CoverageGuard<'_> {
    /// Number of registered classes.
    pub fn size(&self) -> usize {
        self.0.len()
    }

    /// Clears every class's flags.
    pub fn reset(&self) {
        for class in self.0.values() {
            class.reset();
        }
    }

    /// Owned view of the current flags.
    pub fn snapshot(&self) -> CoverageSnapshot {
        CoverageSnapshot {
            classes: self
                .0
                .iter()
                .map(|(name, class)| (name.clone(), class.record()))
                .collect(),
        }
    }
}

/// Writes `snapshot` to `file`, merging with existing contents if `merge`
/// is set and the file exists.
pub fn persist(snapshot: &CoverageSnapshot, file: &Path, merge: bool) -> Result<()> {
    let combined;
    let out = if merge && file.is_file() {
        let mut existing = load(file)?;
        existing.merge(snapshot);
        combined = existing;
        &combined
    } else {
        snapshot
    };

    if let Some(dir) = file.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let tmp = tmp_path(file);
    {
        let mut w = io::BufWriter::new(fs::File::create(&tmp)?);
        w.write_all(FILE_MAGIC)?;
        w.write_all(&out.to_bytes()?)?;
        w.into_inner().map_err(io::IntoInnerError::into_error)?.sync_all()?;
    }
    fs::rename(&tmp, file)?;
    Ok(())
}

/// Reads a coverage data file.
pub fn load(file: &Path) -> Result<CoverageSnapshot> {
    let bytes = fs::read(file)?;
    let body = bytes
        .strip_prefix(FILE_MAGIC.as_slice())
        .ok_or_else(|| Error::BadDataFile {
            path: file.to_path_buf(),
        })?;
    Ok(CoverageSnapshot::from_bytes(body)?)
}

fn tmp_path(file: &Path) -> PathBuf {
    let mut name = file.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}.tmp", std::process::id()));
    file.with_file_name(name)
}
