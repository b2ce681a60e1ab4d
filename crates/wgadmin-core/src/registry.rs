//! Name-keyed set of tunnels started by this process.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::client::{ClientOptions, TunnelClient};
use crate::config::{validate_tunnel_name, ConfigStore};
use crate::error::{CleanupErrors, Result, TunnelError};
use crate::probe::InterfaceProbe;

enum Slot<B: Backend> {
    /// Name reserved while a start is in flight.
    Starting,
    Running(Arc<TunnelClient<B>>),
}

type Slots<B> = Arc<Mutex<HashMap<String, Slot<B>>>>;

/// Releases a `Starting` reservation unless the start completed.
struct Reservation<B: Backend> {
    slots: Slots<B>,
    name: String,
    armed: bool,
}

impl<B: Backend> Reservation<B> {
    fn fulfil(mut self, client: Arc<TunnelClient<B>>) {
        self.armed = false;
        self.slots.lock().insert(self.name.clone(), Slot::Running(client));
    }
}

impl<B: Backend> Drop for Reservation<B> {
    fn drop(&mut self) {
        if self.armed {
            let mut slots = self.slots.lock();
            if matches!(slots.get(&self.name), Some(Slot::Starting)) {
                slots.remove(&self.name);
            }
        }
    }
}

/// Tunnels started by this process, at most one per name.
///
/// The map lock is held only for lookups and edits, never across a start
/// or stop. A name maps to a client only while that client is running.
pub struct TunnelRegistry<B: Backend> {
    backend: Arc<B>,
    store: ConfigStore,
    options: ClientOptions,
    probe: Arc<dyn InterfaceProbe>,
    slots: Slots<B>,
}

impl<B: Backend> std::fmt::Debug for TunnelRegistry<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelRegistry")
            .field("store", &self.store)
            .field("running", &self.running())
            .finish_non_exhaustive()
    }
}

impl<B: Backend> TunnelRegistry<B> {
    /// Creates an empty registry.
    ///
    /// `options` is the template for every client; its interface name is
    /// replaced by the tunnel name.
    pub fn new(backend: Arc<B>, store: ConfigStore, options: ClientOptions, probe: Arc<dyn InterfaceProbe>) -> Self {
        Self {
            backend,
            store,
            options,
            probe,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The tunnel-file store clients are loaded from.
    #[must_use]
    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Loads the tunnel file for `name` and starts it.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` if `name` is running or being started; otherwise
    /// any load, validation or start error.
    pub async fn start(&self, name: &str, cancel: &CancellationToken) -> Result<Arc<TunnelClient<B>>> {
        validate_tunnel_name(name)?;
        let reservation = self.reserve(name)?;

        let config = self.store.load(name)?;
        let options = self.options.clone().with_interface_name(name);
        let client = Arc::new(TunnelClient::new(config, Arc::clone(&self.backend), options)?);
        client.start(cancel).await?;

        reservation.fulfil(Arc::clone(&client));
        info!(tunnel = %name, "registered tunnel");
        Ok(client)
    }

    fn reserve(&self, name: &str) -> Result<Reservation<B>> {
        let mut slots = self.slots.lock();
        if slots.contains_key(name) {
            return Err(TunnelError::already_running(name));
        }
        slots.insert(name.to_string(), Slot::Starting);
        Ok(Reservation {
            slots: Arc::clone(&self.slots),
            name: name.to_string(),
            armed: true,
        })
    }

    /// Unregisters `name` and stops it.
    ///
    /// The entry is removed before the slow stop so a new start for the
    /// same name can proceed.
    ///
    /// # Errors
    ///
    /// `NotRunning` if `name` is not running; cleanup errors from the stop.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let client = {
            let mut slots = self.slots.lock();
            match slots.get(name) {
                Some(Slot::Running(_)) => match slots.remove(name) {
                    Some(Slot::Running(client)) => client,
                    _ => return Err(TunnelError::not_running(name)),
                },
                _ => return Err(TunnelError::not_running(name)),
            }
        };
        debug!(tunnel = %name, "unregistered tunnel");
        client.stop().await
    }

    /// Stops every running tunnel, collecting failures.
    ///
    /// # Errors
    ///
    /// `Cleanup` listing every tunnel that failed to stop cleanly.
    pub async fn stop_all(&self) -> Result<()> {
        let clients: Vec<(String, Arc<TunnelClient<B>>)> = {
            let mut slots = self.slots.lock();
            let names: Vec<String> = slots
                .iter()
                .filter(|(_, slot)| matches!(slot, Slot::Running(_)))
                .map(|(name, _)| name.clone())
                .collect();
            names
                .into_iter()
                .filter_map(|name| match slots.remove(&name) {
                    Some(Slot::Running(client)) => Some((name, client)),
                    _ => None,
                })
                .collect()
        };

        let mut errors = CleanupErrors::default();
        for (name, client) in clients {
            if let Err(e) = client.stop().await {
                warn!(tunnel = %name, error = %e, "failed to stop tunnel cleanly");
                errors.push(e);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TunnelError::Cleanup(errors))
        }
    }

    /// The running client for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<TunnelClient<B>>> {
        match self.slots.lock().get(name) {
            Some(Slot::Running(client)) => Some(Arc::clone(client)),
            _ => None,
        }
    }

    /// Names of running tunnels, sorted.
    #[must_use]
    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Running(_)))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// True if `name` is running here or an interface of that name exists.
    #[must_use]
    pub fn is_active(&self, name: &str) -> bool {
        self.get(name).is_some() || self.probe.exists(name)
    }
}
