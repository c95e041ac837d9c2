//! Process-wide coverage runtime.
//!
//! A [`Runtime`] owns the live coverage store, the cached settings, the
//! end-of-life [`ExitHook`], and the control service. All four change
//! together through [`Runtime::reset`].

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{error, info, warn};

use crate::config::{Properties, Settings};
use crate::controller::{ControlHost, Controller};
use crate::data::{ClassCoverage, CoverageData};
use crate::exit_hook::ExitHook;
use crate::lock::FileLock;
use crate::persist::{self, DumpReport};
use crate::Result;

/// How [`Runtime::reset`] treats one piece of state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetAction {
    /// Keep the current value; create one only if absent.
    #[default]
    Noop,
    /// Discard the current value and create a fresh one.
    New,
    /// Discard the current value.
    Clear,
}

impl SetAction {
    const fn clears(self) -> bool {
        matches!(self, Self::New | Self::Clear)
    }

    const fn creates(self) -> bool {
        matches!(self, Self::New | Self::Noop)
    }
}

/// One [`SetAction`] per piece of runtime state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResetActions {
    /// Cached settings.
    pub settings: SetAction,
    /// Live coverage store.
    pub coverage: SetAction,
    /// End-of-life dump hook.
    pub exit_hook: SetAction,
    /// Control service.
    pub controller: SetAction,
}

impl ResetActions {
    /// Applies the same action to everything.
    pub const fn all(action: SetAction) -> Self {
        Self {
            settings: action,
            coverage: action,
            exit_hook: action,
            controller: action,
        }
    }
}

type SettingsLoader = Box<dyn Fn() -> Settings + Send + Sync>;

#[derive(Debug, Default)]
struct State {
    settings: Option<Settings>,
    coverage: Option<Arc<CoverageData>>,
    exit_hook: Option<Arc<ExitHook>>,
}

/// Coverage runtime for one process.
pub struct Runtime {
    /// Weak self-reference handed to the controller.
    this: Weak<Self>,
    /// Produces settings whenever they are (re)created.
    load_settings: SettingsLoader,
    /// Settings, store, and exit hook.
    state: Mutex<State>,
    /// Control service slot; also serializes `reset`.
    controller: Mutex<Option<Controller>>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("state", &*self.state())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Creates an empty runtime whose settings come from `load`.
    ///
    /// Nothing is armed until the first [`reset`](Self::reset).
    pub fn new(load: impl Fn() -> Settings + Send + Sync + 'static) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            load_settings: Box::new(load),
            state: Mutex::new(State::default()),
            controller: Mutex::new(None),
        })
    }

    /// Creates a runtime with fixed settings.
    pub fn with_settings(settings: Settings) -> Arc<Self> {
        Self::new(move || settings.clone())
    }

    /// Creates a runtime that reads properties from the default file and
    /// the `COVRT_*` environment each time settings are created.
    pub fn from_environment() -> Arc<Self> {
        Self::new(|| match Properties::load(None, &Properties::new()) {
            Ok(props) => Settings::from_properties(&props),
            Err(e) => {
                warn!(error = %e, "could not read runtime properties, using defaults");
                Settings::default()
            }
        })
    }

    /// Creates a runtime and arms everything with [`SetAction::Noop`].
    pub fn start(load: impl Fn() -> Settings + Send + Sync + 'static) -> Result<Arc<Self>> {
        let rt = Self::new(load);
        rt.reset(ResetActions::default())?;
        Ok(rt)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn controller_slot(&self) -> MutexGuard<'_, Option<Controller>> {
        self.controller.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `actions` as one transition.
    ///
    /// Resets are serialized. A controller being discarded is shut down
    /// without holding the state lock, so its in-flight handler can still
    /// reach the runtime. If a new controller fails to start, the exit
    /// hook is disarmed and the error returned.
    pub fn reset(&self, actions: ResetActions) -> Result<()> {
        let mut slot = self.controller_slot();

        let settings = {
            let mut st = self.state();
            if actions.settings.clears() {
                st.settings = None;
            }
            if actions.settings.creates() && st.settings.is_none() {
                st.settings = Some((self.load_settings)());
            }

            if actions.coverage.clears() {
                st.coverage = None;
            }
            if actions.coverage.creates() && st.coverage.is_none() {
                st.coverage = Some(Arc::new(CoverageData::new()));
                info!("collecting runtime coverage data");
            }

            if actions.exit_hook.clears()
                && let Some(hook) = st.exit_hook.take()
            {
                hook.disarm();
            }
            let current = st.settings.clone().unwrap_or_else(|| (self.load_settings)());
            if actions.exit_hook.creates() && st.exit_hook.is_none() {
                let lock = current.file_lock_for(&current.out_file)?;
                st.exit_hook = Some(Arc::new(ExitHook::new(
                    st.coverage.clone(),
                    current.out_file.clone(),
                    current.out_merge,
                    lock,
                )));
            }
            current
        };

        if actions.controller.clears()
            && let Some(controller) = slot.take()
        {
            controller.shutdown();
        }
        if actions.controller.creates() && slot.is_none() && settings.control {
            let host: Weak<dyn ControlHost> = self.this.clone();
            let controller =
                Controller::new(host, settings.control_port).with_grace(settings.control_grace);
            if let Err(e) = controller.start() {
                error!(error = %e, "runtime controller could not be started");
                if let Some(hook) = self.state().exit_hook.take() {
                    hook.disarm();
                }
                return Err(e);
            }
            *slot = Some(controller);
        }
        Ok(())
    }

    /// The live coverage store.
    pub fn coverage(&self) -> Option<Arc<CoverageData>> {
        self.state().coverage.clone()
    }

    /// Current settings, loading them if none are cached.
    pub fn settings(&self) -> Settings {
        self.state()
            .settings
            .clone()
            .unwrap_or_else(|| (self.load_settings)())
    }

    /// Returns `true` while an exit hook is armed.
    pub fn auto_dump_armed(&self) -> bool {
        self.state().exit_hook.as_ref().is_some_and(|h| h.is_armed())
    }

    /// Address of the running control service.
    pub fn control_addr(&self) -> Option<std::net::SocketAddr> {
        self.controller_slot().as_ref().and_then(Controller::local_addr)
    }

    /// Registers an instrumented class with the live store.
    pub fn register_class(&self, class: ClassCoverage) -> Option<Arc<ClassCoverage>> {
        self.coverage().map(|data| data.add_class(class))
    }

    /// Dumps coverage now.
    ///
    /// `None` arguments fall back to settings. With `stop_collection`, the
    /// store is detached from the runtime first so no further classes
    /// register with it.
    pub fn dump(
        &self,
        out_file: Option<&Path>,
        merge: Option<bool>,
        stop_collection: bool,
    ) -> Result<Option<DumpReport>> {
        let (data, settings) = {
            let mut st = self.state();
            let data = if stop_collection {
                st.coverage.take()
            } else {
                st.coverage.clone()
            };
            let settings = st.settings.clone().unwrap_or_else(|| (self.load_settings)());
            (data, settings)
        };
        let out_file = out_file.map_or_else(|| settings.out_file.clone(), Path::to_path_buf);
        let merge = merge.unwrap_or(settings.out_merge);
        let mut lock = settings.file_lock_for(&out_file)?;
        persist::dump_coverage(
            data.as_deref(),
            !stop_collection,
            &out_file,
            merge,
            lock.as_mut().map(|l| l as &mut dyn FileLock),
        )
    }

    /// Stops the control service and runs the exit hook.
    pub fn terminate(&self) -> Result<Option<DumpReport>> {
        if let Some(controller) = self.controller_slot().take() {
            controller.shutdown();
        }
        let hook = self.state().exit_hook.take();
        match hook {
            Some(hook) => hook.run(),
            None => Ok(None),
        }
    }

    /// Runs [`terminate`](Self::terminate) on SIGINT or SIGTERM.
    #[cfg(unix)]
    pub fn install_signal_handler(&self) -> Result<signal_hook::iterator::Handle> {
        let this = self.this.clone();
        let handle = crate::exit_hook::watch_signals(move || {
            if let Some(rt) = this.upgrade()
                && let Err(e) = rt.terminate()
            {
                error!(error = %e, "coverage dump on signal failed");
            }
        })?;
        Ok(handle)
    }
}

impl ControlHost for Runtime {
    fn coverage(&self) -> Option<Arc<CoverageData>> {
        Self::coverage(self)
    }

    fn settings(&self) -> Settings {
        Self::settings(self)
    }

    /// Clears only the exit hook. The store stays in place: classes that
    /// already registered keep recording into it.
    fn disable_auto_dump(&self) {
        if let Some(hook) = self.state().exit_hook.take() {
            hook.disarm();
        }
    }
}
