//! Runtime properties and the typed settings derived from them.
//!
//! Properties are a flat `key → string` map layered from, lowest
//! precedence first: built-in defaults, a JSON properties file, `COVRT_*`
//! environment variables, and explicit overrides.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use covrt_proto::{ClientDefaults, DEFAULT_HOST, DEFAULT_PORT, parse_bool};
use tracing::warn;

use crate::lock::SocketMutex;
use crate::{Error, Result};

/// Well-known property keys.
pub mod keys {
    /// Enables the runtime control service.
    pub const CONTROL: &str = "rt.control";
    /// Host the control client connects to.
    pub const CONTROL_HOST: &str = "rt.control.host";
    /// Control service port.
    pub const CONTROL_PORT: &str = "rt.control.port";
    /// Shutdown grace period per service thread, in milliseconds.
    pub const CONTROL_GRACE: &str = "rt.control.grace";
    /// Enables the cross-process output file lock.
    pub const FILE_LOCK: &str = "rt.filelock";
    /// First port of the lock port range.
    pub const FILE_LOCK_PORT_BASE: &str = "rt.filelock.portbase";
    /// Lock acquisition timeout, in milliseconds.
    pub const FILE_LOCK_MAX_TIME: &str = "rt.filelock.maxtime";
    /// Lock acquisition retry budget.
    pub const FILE_LOCK_RETRIES: &str = "rt.filelock.retries";
    /// Default coverage output file.
    pub const OUT_FILE: &str = "coverage.out.file";
    /// Default merge flag for coverage output.
    pub const OUT_MERGE: &str = "coverage.out.merge";
}

/// Environment variable prefix mapped onto property keys.
const ENV_PREFIX: &str = "COVRT_";

/// Environment variable naming an explicit properties file.
pub const ENV_PROPERTIES: &str = "COVRT_PROPERTIES";

/// Default coverage output file name.
pub const DEFAULT_OUT_FILE: &str = "coverage.ec";

/// Flat string properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    map: BTreeMap<String, String>,
}

impl Properties {
    /// Creates an empty property set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    /// Sets `key` to `value`, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), value.into());
    }

    /// Number of properties.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if no property is set.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Overlays `other` on top of `self`.
    pub fn overlay(&mut self, other: &Self) {
        for (k, v) in &other.map {
            self.map.insert(k.clone(), v.clone());
        }
    }

    /// Parses a JSON object whose values are strings, numbers, or booleans.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let serde_json::Value::Object(obj) = value else {
            return Err(Error::InvalidArgument(
                "properties must be a JSON object".into(),
            ));
        };
        let mut props = Self::new();
        for (k, v) in obj {
            match v {
                serde_json::Value::String(s) => props.set(k, s),
                serde_json::Value::Bool(b) => props.set(k, b.to_string()),
                serde_json::Value::Number(n) => props.set(k, n.to_string()),
                other => warn!(key = %k, value = %other, "ignoring non-scalar property"),
            }
        }
        Ok(props)
    }

    /// Reads a JSON properties file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    /// Collects `COVRT_*` variables: `COVRT_RT_CONTROL_PORT` becomes
    /// `rt.control.port`.
    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut props = Self::new();
        for (name, value) in vars {
            if name == ENV_PROPERTIES {
                continue;
            }
            if let Some(rest) = name.strip_prefix(ENV_PREFIX)
                && !rest.is_empty()
            {
                props.set(rest.to_ascii_lowercase().replace('_', "."), value);
            }
        }
        props
    }

    /// Properties file location: `$COVRT_PROPERTIES`, else
    /// `<config dir>/covrt/properties.json`.
    pub fn default_file() -> Option<PathBuf> {
        std::env::var_os(ENV_PROPERTIES)
            .map(PathBuf::from)
            .or_else(|| dirs::config_dir().map(|d| d.join("covrt").join("properties.json")))
    }

    /// Loads the layered property set with `overrides` on top.
    ///
    /// A missing properties file is not an error; a malformed one is.
    pub fn load(file: Option<&Path>, overrides: &Self) -> Result<Self> {
        let mut props = Self::new();
        let file = file.map(Path::to_path_buf).or_else(Self::default_file);
        if let Some(path) = file.filter(|p| p.is_file()) {
            props.overlay(&Self::from_json_file(&path)?);
        }
        props.overlay(&Self::from_vars(std::env::vars()));
        props.overlay(overrides);
        Ok(props)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut props = Self::new();
        for (k, v) in iter {
            props.set(k, v);
        }
        props
    }
}

/// Typed runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Whether the control service is started with the runtime.
    pub control: bool,
    /// Host the control client connects to.
    pub control_host: String,
    /// Control service port (`0` picks an ephemeral port).
    pub control_port: u16,
    /// How long shutdown waits for each service thread.
    pub control_grace: Duration,
    /// Whether output files are guarded by the cross-process lock.
    pub file_lock: bool,
    /// First port of the lock port range.
    pub lock_port_base: u16,
    /// Lock acquisition timeout.
    pub lock_timeout: Duration,
    /// Lock acquisition retry budget.
    pub lock_retries: u32,
    /// Default coverage output file.
    pub out_file: PathBuf,
    /// Default merge flag.
    pub out_merge: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            control: false,
            control_host: DEFAULT_HOST.to_owned(),
            control_port: DEFAULT_PORT,
            control_grace: Duration::from_secs(30),
            file_lock: true,
            lock_port_base: crate::lock::DEFAULT_PORT_BASE,
            lock_timeout: Duration::from_millis(crate::lock::DEFAULT_TIMEOUT_MS),
            lock_retries: crate::lock::DEFAULT_RETRIES,
            out_file: PathBuf::from(DEFAULT_OUT_FILE),
            out_merge: true,
        }
    }
}

impl Settings {
    /// Parses `props` over the defaults. Malformed values are logged and
    /// ignored.
    pub fn from_properties(props: &Properties) -> Self {
        let mut s = Self::default();
        if let Some(v) = props.get(keys::CONTROL) {
            s.control = parse_bool(v);
        }
        if let Some(v) = props.get(keys::CONTROL_HOST).filter(|v| !v.trim().is_empty()) {
            v.trim().clone_into(&mut s.control_host);
        }
        parse_into(props, keys::CONTROL_PORT, &mut s.control_port);
        if let Some(ms) = parse_num::<u64>(props, keys::CONTROL_GRACE) {
            s.control_grace = Duration::from_millis(ms);
        }
        if let Some(v) = props.get(keys::FILE_LOCK) {
            s.file_lock = parse_bool(v);
        }
        if let Some(base) = parse_num::<u16>(props, keys::FILE_LOCK_PORT_BASE) {
            if base <= crate::lock::MAX_PORT_BASE {
                s.lock_port_base = base;
            } else {
                warn!(key = keys::FILE_LOCK_PORT_BASE, base, "port base out of range, ignoring");
            }
        }
        if let Some(ms) = parse_num::<u64>(props, keys::FILE_LOCK_MAX_TIME) {
            s.lock_timeout = Duration::from_millis(ms);
        }
        parse_into(props, keys::FILE_LOCK_RETRIES, &mut s.lock_retries);
        if let Some(v) = props.get(keys::OUT_FILE).filter(|v| !v.is_empty()) {
            s.out_file = PathBuf::from(v);
        }
        if let Some(v) = props.get(keys::OUT_MERGE) {
            s.out_merge = parse_bool(v);
        }
        s
    }

    /// The cross-process lock guarding `out_file`, or `None` when locking
    /// is disabled.
    pub fn file_lock_for(&self, out_file: &Path) -> Result<Option<SocketMutex>> {
        if !self.file_lock {
            return Ok(None);
        }
        let lock = SocketMutex::for_file(
            out_file,
            self.lock_port_base,
            self.lock_timeout,
            self.lock_retries,
        )?;
        Ok(Some(lock))
    }

    /// Values used to fill absent client-side command arguments.
    pub fn client_defaults(&self) -> ClientDefaults {
        ClientDefaults {
            out_file: self.out_file.to_string_lossy().into_owned(),
            merge: self.out_merge,
        }
    }
}

fn parse_num<T: std::str::FromStr>(props: &Properties, key: &str) -> Option<T> {
    let raw = props.get(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = raw, "malformed property value, ignoring");
            None
        }
    }
}

fn parse_into<T: std::str::FromStr>(props: &Properties, key: &str, slot: &mut T) {
    if let Some(v) = parse_num(props, key) {
        *slot = v;
    }
}
