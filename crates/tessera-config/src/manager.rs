//! The configuration manager: the single current signing configuration,
//! behind a process-wide read/write lock.
//!
//! Ordinary log calls take the read lock just long enough to allocate a
//! sequence number under the current config, so readers never block each
//! other. `update_configuration` takes the write lock and excludes all of
//! them while it swaps configs.
//!
//! Between `disable` (called by `prepare_reset`) and `reset`, every reader
//! and writer fails fast with `SystemDisabled`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{RwLock, RwLockWriteGuard};
use tracing::{info, warn};

use tessera_contracts::{
    error::{TesseraError, TesseraResult},
    signing::SigningConfig,
};
use tessera_core::traits::{ConfigStore, Scheduler, TimeSource};

use crate::{settings::InitialSigning, token::CryptoToken};

/// A signing configuration together with its opened crypto token.
pub struct ActiveConfig {
    pub config: SigningConfig,
    pub token: CryptoToken,
}

impl ActiveConfig {
    pub fn id(&self) -> u64 {
        self.config.id
    }
}

#[derive(Default)]
struct ManagerState {
    current: Option<Arc<ActiveConfig>>,
    disabled: bool,
}

/// Cache of the current `SigningConfig`, its token, and the scheduler that
/// forces periodic signatures.
pub struct ConfigurationManager {
    store: Arc<dyn ConfigStore>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn TimeSource>,
    initial: InitialSigning,
    state: RwLock<ManagerState>,
}

impl ConfigurationManager {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn TimeSource>,
        initial: InitialSigning,
    ) -> Self {
        Self {
            store,
            scheduler,
            clock,
            initial,
            state: RwLock::new(ManagerState::default()),
        }
    }

    /// The current configuration, loaded from the store on first use.
    ///
    /// # Errors
    ///
    /// `SystemDisabled` while a reset is in progress; store or token errors
    /// on first load.
    pub fn current_configuration(&self) -> TesseraResult<Arc<ActiveConfig>> {
        self.with_current(Arc::clone)
    }

    /// Run `f` against the current configuration while holding the read lock.
    ///
    /// The config cannot change until `f` returns. The write path allocates
    /// its sequence number inside `f` so that no record is ever stamped
    /// with a config that has already been superseded.
    pub fn with_current<R>(&self, f: impl FnOnce(&Arc<ActiveConfig>) -> R) -> TesseraResult<R> {
        {
            let state = self.state.read();
            if state.disabled {
                return Err(TesseraError::SystemDisabled);
            }
            if let Some(current) = &state.current {
                return Ok(f(current));
            }
        }

        let mut state = self.state.write();
        if state.disabled {
            return Err(TesseraError::SystemDisabled);
        }
        if state.current.is_none() {
            let active = self.load()?;
            self.reschedule(active.config.frequency_ms);
            state.current = Some(Arc::new(active));
        }
        let state = RwLockWriteGuard::downgrade(state);
        match &state.current {
            Some(current) => Ok(f(current)),
            None => Err(TesseraError::Configuration {
                reason: "no current signing configuration".to_string(),
            }),
        }
    }

    /// Validate, activate, and persist `draft`, then make it current.
    ///
    /// The draft's `id` and `activated_at` are assigned here. Nothing changes
    /// if validation or key activation fails. The previous config's token is
    /// released once the last in-flight write holding it completes.
    pub fn update_configuration(&self, draft: SigningConfig) -> TesseraResult<Arc<ActiveConfig>> {
        if let Err(e) = draft.validate() {
            warn!(error = %e, "rejected signing configuration");
            return Err(e);
        }

        let mut state = self.state.write();
        if state.disabled {
            return Err(TesseraError::SystemDisabled);
        }

        let mut config = draft;
        config.id = self.next_id(state.current.as_deref())?;
        config.activated_at = self.clock.now().at;

        let token = CryptoToken::open(&config)?;
        self.store.insert_config(&config)?;

        let active = Arc::new(ActiveConfig { config, token });
        if let Some(previous) = state.current.replace(Arc::clone(&active)) {
            info!(config_id = previous.id(), "signing configuration deactivated");
        }
        self.reschedule(active.config.frequency_ms);

        info!(
            config_id = active.id(),
            mode = active.config.mode.name(),
            key_label = %active.config.mode.key_label(),
            frequency_ms = active.config.frequency_ms,
            "signing configuration activated"
        );

        Ok(active)
    }

    /// Reject all further reads and updates until `reset`.
    pub fn disable(&self) {
        self.state.write().disabled = true;
        info!("configuration manager disabled");
    }

    pub fn is_disabled(&self) -> bool {
        self.state.read().disabled
    }

    /// Drop the cached config and re-enable. The next read reloads from the
    /// store.
    pub fn reset(&self) {
        let mut state = self.state.write();
        if let Some(previous) = state.current.take() {
            previous.token.close();
        }
        self.scheduler.cancel();
        state.disabled = false;
        info!("configuration manager reset");
    }

    fn load(&self) -> TesseraResult<ActiveConfig> {
        let config = match self.store.find_latest_config()? {
            Some(config) => config,
            None => {
                let mut config = self.initial.build()?;
                config.id = 1;
                config.activated_at = self.clock.now().at;
                self.store.insert_config(&config)?;
                info!(config_id = config.id, mode = config.mode.name(), "initial signing configuration created");
                config
            }
        };
        let token = CryptoToken::open(&config)?;
        Ok(ActiveConfig { config, token })
    }

    fn next_id(&self, current: Option<&ActiveConfig>) -> TesseraResult<u64> {
        let stored = self.store.find_latest_config()?.map(|c| c.id).unwrap_or(0);
        let cached = current.map(|c| c.id()).unwrap_or(0);
        Ok(stored.max(cached) + 1)
    }

    fn reschedule(&self, frequency_ms: u64) {
        if frequency_ms == 0 {
            self.scheduler.cancel();
        } else {
            self.scheduler.schedule(Duration::from_millis(frequency_ms));
        }
    }
}
