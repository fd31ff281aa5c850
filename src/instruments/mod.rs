//! Instrument connection manager.
//!
//! Process-wide broker of instrument drivers. The manager guarantees exactly
//! one live connection per instrument id and serialises concurrent users
//! through leases:
//!
//! - A lease is an owned lock guard over the instrument's driver slot, so
//!   exclusivity and release-on-drop come from the type system rather than
//!   manual bookkeeping. Dropping the lease (including on a panic unwind)
//!   releases the instrument.
//! - Connections are lazy: the first `acquire` constructs the driver via the
//!   [`DriverRegistry`], initialises it (reset + probe) and moves the entry
//!   from OFFLINE to IDLE before handing out the lease.
//! - An I/O error during use flags the slot needs-reset; the next `acquire`
//!   resets the driver before handing out a lease.
//!
//! Long measurement I/O runs while the caller holds the lease, outside the
//! manager's registry lock, so one slow instrument never starves the others.

pub mod chassis_link;
pub mod driver;
pub mod mock;
pub mod scpi;
#[cfg(feature = "instrument_serial")]
pub mod serial;
pub mod transport;

pub use driver::{Driver, DriverRegistry, MeasureKind};

use crate::config::InstrumentSpec;
use crate::error::{PdtError, PdtResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

/// Runtime connection state of one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstrumentState {
    /// No live connection
    Offline,
    /// Connected and free
    Idle,
    /// Leased by a session point
    Busy,
    /// Last operation failed; next acquire resets
    Error,
}

/// Status snapshot for the HTTP instruments endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct InstrumentStatus {
    /// Stable instrument key
    pub id: String,
    /// Connection state
    pub state: InstrumentState,
    /// Most recent driver error, if any
    pub last_error: Option<String>,
    /// When a lease was last released
    pub last_used_at: Option<DateTime<Utc>>,
    /// Session/point currently holding the lease
    pub busy_holder: Option<String>,
}

/// Driver slot guarded by the per-entry async mutex.
#[derive(Debug)]
struct DriverSlot {
    driver: Option<Box<dyn Driver>>,
    needs_reset: bool,
}

#[derive(Debug, Clone)]
struct EntryMeta {
    state: InstrumentState,
    last_error: Option<String>,
    last_used_at: Option<DateTime<Utc>>,
    holder: Option<String>,
}

#[derive(Debug)]
struct EntryShared {
    id: String,
    meta: Mutex<EntryMeta>,
}

impl EntryShared {
    fn new(id: String) -> Self {
        Self {
            id,
            meta: Mutex::new(EntryMeta {
                state: InstrumentState::Offline,
                last_error: None,
                last_used_at: None,
                holder: None,
            }),
        }
    }

    fn set_state(&self, state: InstrumentState) {
        if let Ok(mut meta) = self.meta.lock() {
            meta.state = state;
        }
    }

    fn set_busy(&self, holder: &str) {
        if let Ok(mut meta) = self.meta.lock() {
            meta.state = InstrumentState::Busy;
            meta.holder = Some(holder.to_string());
        }
    }

    fn set_error(&self, error: &str) {
        if let Ok(mut meta) = self.meta.lock() {
            meta.state = InstrumentState::Error;
            meta.last_error = Some(error.to_string());
        }
    }

    fn release(&self) {
        if let Ok(mut meta) = self.meta.lock() {
            if meta.state == InstrumentState::Busy {
                meta.state = InstrumentState::Idle;
            }
            meta.holder = None;
            meta.last_used_at = Some(Utc::now());
        }
    }

    fn snapshot(&self) -> InstrumentStatus {
        let meta = self
            .meta
            .lock()
            .map(|m| m.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone());
        InstrumentStatus {
            id: self.id.clone(),
            state: meta.state,
            last_error: meta.last_error,
            last_used_at: meta.last_used_at,
            busy_holder: meta.holder,
        }
    }
}

struct Entry {
    spec: InstrumentSpec,
    slot: Arc<tokio::sync::Mutex<DriverSlot>>,
    shared: Arc<EntryShared>,
}

/// Exclusive access to one instrument's driver.
///
/// The lease is released when dropped; release is therefore idempotent and
/// runs on every exit path, panics included.
#[derive(Debug)]
pub struct InstrumentLease {
    guard: OwnedMutexGuard<DriverSlot>,
    shared: Arc<EntryShared>,
}

impl InstrumentLease {
    /// Instrument id this lease covers.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// The leased driver.
    pub fn driver_mut(&mut self) -> PdtResult<&mut dyn Driver> {
        match self.guard.driver.as_deref_mut() {
            Some(driver) => Ok(driver),
            None => Err(PdtError::Instrument(format!(
                "{}: driver not connected",
                self.shared.id
            ))),
        }
    }

    /// Record a driver I/O failure: the instrument turns ERROR and the next
    /// acquire resets it before handing out a lease.
    pub fn mark_failed(&mut self, error: &str) {
        self.guard.needs_reset = true;
        self.shared.set_error(error);
    }
}

impl Drop for InstrumentLease {
    fn drop(&mut self) {
        self.shared.release();
    }
}

/// Process-wide instrument registry and lease broker.
pub struct InstrumentManager {
    registry: DriverRegistry,
    acquire_timeout: Duration,
    entries: Mutex<HashMap<String, Arc<Entry>>>,
}

impl InstrumentManager {
    /// Build the manager from the instrument registry file contents.
    pub fn new(
        registry: DriverRegistry,
        specs: Vec<InstrumentSpec>,
        acquire_timeout: Duration,
    ) -> Self {
        let entries = specs
            .into_iter()
            .map(|spec| {
                let id = spec.id.clone();
                let entry = Arc::new(Entry {
                    shared: Arc::new(EntryShared::new(id.clone())),
                    slot: Arc::new(tokio::sync::Mutex::new(DriverSlot {
                        driver: None,
                        needs_reset: false,
                    })),
                    spec,
                });
                (id, entry)
            })
            .collect();
        Self {
            registry,
            acquire_timeout,
            entries: Mutex::new(entries),
        }
    }

    fn entry(&self, instrument_id: &str) -> PdtResult<Arc<Entry>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| PdtError::Instrument("instrument registry lock poisoned".to_string()))?;
        entries
            .get(instrument_id)
            .cloned()
            .ok_or_else(|| PdtError::InstrumentNotConfigured(instrument_id.to_string()))
    }

    /// Lease an instrument for exclusive use.
    ///
    /// Blocks until the instrument is free or the acquire timeout elapses.
    /// An OFFLINE instrument is connected first; an ERROR instrument is reset
    /// before the lease is handed out.
    pub async fn acquire(&self, instrument_id: &str, owner: &str) -> PdtResult<InstrumentLease> {
        let entry = self.entry(instrument_id)?;

        let mut guard = tokio::time::timeout(self.acquire_timeout, entry.slot.clone().lock_owned())
            .await
            .map_err(|_| PdtError::InstrumentBusy(instrument_id.to_string()))?;

        if guard.driver.is_none() {
            info!(instrument = instrument_id, "connecting instrument");
            let mut driver = self.registry.create(&entry.spec)?;
            if let Err(e) = driver.initialize().await {
                let msg = format!("{instrument_id}: initialize failed: {e}");
                entry.shared.set_error(&msg);
                return Err(PdtError::Instrument(msg));
            }
            guard.driver = Some(driver);
            guard.needs_reset = false;
            entry.shared.set_state(InstrumentState::Idle);
        } else if guard.needs_reset {
            info!(instrument = instrument_id, "resetting instrument after error");
            let reset = match guard.driver.as_deref_mut() {
                Some(driver) => driver.reset().await,
                None => Ok(()),
            };
            if let Err(e) = reset {
                let msg = format!("{instrument_id}: reset failed: {e}");
                entry.shared.set_error(&msg);
                return Err(PdtError::Instrument(msg));
            }
            guard.needs_reset = false;
            entry.shared.set_state(InstrumentState::Idle);
        }

        entry.shared.set_busy(owner);
        Ok(InstrumentLease {
            guard,
            shared: entry.shared.clone(),
        })
    }

    /// Explicit release; dropping the lease is equivalent.
    pub fn release(&self, lease: InstrumentLease) {
        drop(lease);
    }

    /// Force a driver reset outside a measurement.
    pub async fn reset(&self, instrument_id: &str) -> PdtResult<()> {
        let entry = self.entry(instrument_id)?;
        let mut guard = tokio::time::timeout(self.acquire_timeout, entry.slot.clone().lock_owned())
            .await
            .map_err(|_| PdtError::InstrumentBusy(instrument_id.to_string()))?;

        match guard.driver.as_deref_mut() {
            Some(driver) => {
                if let Err(e) = driver.reset().await {
                    let msg = format!("{instrument_id}: reset failed: {e}");
                    entry.shared.set_error(&msg);
                    return Err(PdtError::Instrument(msg));
                }
                guard.needs_reset = false;
                entry.shared.set_state(InstrumentState::Idle);
                Ok(())
            }
            // Nothing connected: a reset request just re-arms lazy connect.
            None => {
                entry.shared.set_state(InstrumentState::Offline);
                Ok(())
            }
        }
    }

    /// Tear down one connection; the entry returns to OFFLINE.
    pub async fn disconnect(&self, instrument_id: &str) -> PdtResult<()> {
        let entry = self.entry(instrument_id)?;
        let mut guard = tokio::time::timeout(self.acquire_timeout, entry.slot.clone().lock_owned())
            .await
            .map_err(|_| PdtError::InstrumentBusy(instrument_id.to_string()))?;

        if let Some(mut driver) = guard.driver.take() {
            if let Err(e) = driver.shutdown().await {
                warn!(instrument = instrument_id, error = %e, "shutdown reported an error");
            }
        }
        guard.needs_reset = false;
        entry.shared.set_state(InstrumentState::Offline);
        Ok(())
    }

    /// Disconnect every instrument (server shutdown path).
    pub async fn disconnect_all(&self) {
        let ids: Vec<String> = {
            match self.entries.lock() {
                Ok(entries) => entries.keys().cloned().collect(),
                Err(_) => Vec::new(),
            }
        };
        for id in ids {
            if let Err(e) = self.disconnect(&id).await {
                warn!(instrument = %id, error = %e, "disconnect failed");
            }
        }
    }

    /// Status snapshot of every configured instrument.
    pub fn status(&self) -> Vec<InstrumentStatus> {
        let entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut out: Vec<InstrumentStatus> =
            entries.values().map(|e| e.shared.snapshot()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Whether an instrument id is configured.
    pub fn is_configured(&self, instrument_id: &str) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.contains_key(instrument_id))
            .unwrap_or(false)
    }
}

/// Register the built-in driver kinds.
pub fn register_builtin_drivers(registry: &mut DriverRegistry) {
    scpi::register(registry);
    mock::register(registry);
    chassis_link::register(registry);
    #[cfg(feature = "instrument_serial")]
    serial::register(registry);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstrumentSpec;

    fn mock_spec(id: &str, driver: &str) -> InstrumentSpec {
        InstrumentSpec {
            id: id.to_string(),
            driver: driver.to_string(),
            resource: String::new(),
            baud: None,
            timeout_ms: None,
            options: toml::value::Table::new(),
        }
    }

    fn manager(specs: Vec<InstrumentSpec>) -> InstrumentManager {
        InstrumentManager::new(
            DriverRegistry::with_defaults(),
            specs,
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn acquire_connects_lazily_and_release_frees() {
        let mgr = manager(vec![mock_spec("DMM_1", "mock_dmm")]);
        assert_eq!(mgr.status()[0].state, InstrumentState::Offline);

        let lease = mgr.acquire("DMM_1", "sess/1").await.unwrap();
        assert_eq!(mgr.status()[0].state, InstrumentState::Busy);
        assert_eq!(mgr.status()[0].busy_holder.as_deref(), Some("sess/1"));
        drop(lease);

        assert_eq!(mgr.status()[0].state, InstrumentState::Idle);
        assert!(mgr.status()[0].last_used_at.is_some());
    }

    #[tokio::test]
    async fn unknown_instrument_is_not_configured() {
        let mgr = manager(vec![]);
        let err = mgr.acquire("GHOST_1", "sess/1").await.unwrap_err();
        assert!(matches!(err, PdtError::InstrumentNotConfigured(_)));
    }

    #[tokio::test]
    async fn second_acquire_times_out_while_leased() {
        let mgr = manager(vec![mock_spec("DMM_1", "mock_dmm")]);
        let _lease = mgr.acquire("DMM_1", "sess/1").await.unwrap();
        let err = mgr.acquire("DMM_1", "sess/2").await.unwrap_err();
        assert!(matches!(err, PdtError::InstrumentBusy(_)));
    }

    #[tokio::test]
    async fn mark_failed_resets_on_next_acquire() {
        let mgr = manager(vec![mock_spec("DMM_1", "mock_dmm")]);
        {
            let mut lease = mgr.acquire("DMM_1", "sess/1").await.unwrap();
            lease.mark_failed("query timed out");
        }
        assert_eq!(mgr.status()[0].state, InstrumentState::Error);

        // Next acquire performs the reset and hands out a working lease.
        let mut lease = mgr.acquire("DMM_1", "sess/2").await.unwrap();
        assert!(lease.driver_mut().is_ok());
        drop(lease);
        assert_eq!(mgr.status()[0].state, InstrumentState::Idle);
    }

    #[tokio::test]
    async fn disconnect_returns_entry_to_offline() {
        let mgr = manager(vec![mock_spec("DMM_1", "mock_dmm")]);
        drop(mgr.acquire("DMM_1", "sess/1").await.unwrap());
        mgr.disconnect("DMM_1").await.unwrap();
        assert_eq!(mgr.status()[0].state, InstrumentState::Offline);
    }
}
