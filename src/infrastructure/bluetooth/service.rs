//! Bluetooth Service Module
//!
//! Main service that owns one [`BleDevice`] per peer and keeps the persisted
//! peer list in step with what the application connects to.

use crate::domain::models::{ConnectionState, PeerIdentity};
use crate::domain::settings::SettingsService;
use crate::infrastructure::bluetooth::connection::BleDevice;
use crate::infrastructure::bluetooth::events::ConnectionEvent;
use crate::infrastructure::bluetooth::factory::FactoryChain;
use crate::infrastructure::bluetooth::observer::Observer;
use crate::infrastructure::bluetooth::transport::Transport;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Persists the peer of every successful connection.
struct LastConnectedRecorder {
    settings: Arc<Mutex<SettingsService>>,
}

impl Observer<ConnectionEvent> for LastConnectedRecorder {
    fn on_event(&self, event: &ConnectionEvent) {
        let ConnectionEvent::StateChanged {
            peer,
            state: ConnectionState::Connected,
        } = event
        else {
            return;
        };
        let Ok(mut settings) = self.settings.lock() else {
            warn!("Settings lock poisoned; not recording {}", peer);
            return;
        };
        if let Err(e) = settings.set_last_connected(*peer) {
            warn!("Failed to save last connected peer {}: {}", peer, e);
        }
    }
}

/// Main Bluetooth service coordinating all peers
pub struct BluetoothService {
    transport: Arc<dyn Transport>,
    settings: Arc<Mutex<SettingsService>>,
    factories: FactoryChain,
    devices: Mutex<HashMap<PeerIdentity, BleDevice>>,
    recorder: Arc<LastConnectedRecorder>,
}

impl BluetoothService {
    pub fn new(transport: Arc<dyn Transport>, settings: Arc<Mutex<SettingsService>>) -> Self {
        Self::with_factories(transport, settings, FactoryChain::standard())
    }

    pub fn with_factories(
        transport: Arc<dyn Transport>,
        settings: Arc<Mutex<SettingsService>>,
        factories: FactoryChain,
    ) -> Self {
        Self {
            transport,
            recorder: Arc::new(LastConnectedRecorder {
                settings: settings.clone(),
            }),
            settings,
            factories,
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// The session for `peer`, created on first use.
    pub fn device(&self, peer: PeerIdentity) -> Result<BleDevice> {
        let mut devices = self
            .devices
            .lock()
            .map_err(|_| anyhow::anyhow!("Lock error"))?;
        if let Some(device) = devices.get(&peer) {
            return Ok(device.clone());
        }

        let session_settings = {
            let settings = self
                .settings
                .lock()
                .map_err(|_| anyhow::anyhow!("Lock error"))?;
            settings.get().clone()
        };
        let device = BleDevice::new(
            peer,
            self.transport.clone(),
            &session_settings,
            self.factories.clone(),
        )?;
        device.connection_events().register(&self.recorder);
        devices.insert(peer, device.clone());
        Ok(device)
    }

    pub fn get(&self, peer: PeerIdentity) -> Option<BleDevice> {
        self.devices.lock().ok()?.get(&peer).cloned()
    }

    pub fn devices(&self) -> Vec<BleDevice> {
        self.devices
            .lock()
            .map(|devices| devices.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Get or create the session for `peer`, remember the peer and connect.
    pub fn connect(&self, peer: PeerIdentity) -> Result<BleDevice> {
        let device = self.device(peer)?;
        {
            let mut settings = self
                .settings
                .lock()
                .map_err(|_| anyhow::anyhow!("Lock error"))?;
            settings.add_known_peer(peer)?;
        }
        info!("Connecting to {}", peer);
        device.connect();
        Ok(device)
    }

    /// Forget the session for `peer`, releasing its native handle.
    pub fn remove(&self, peer: PeerIdentity) -> Option<BleDevice> {
        let device = self.devices.lock().ok()?.remove(&peer)?;
        device.close();
        info!("Removed session for {}", peer);
        Some(device)
    }

    pub fn close_all(&self) {
        for device in self.devices() {
            device.close();
        }
    }

    pub fn known_peers(&self) -> Vec<PeerIdentity> {
        self.settings
            .lock()
            .map(|s| s.get().known_peers.clone())
            .unwrap_or_default()
    }

    pub fn last_connected(&self) -> Option<PeerIdentity> {
        self.settings.lock().ok()?.get().last_connected
    }
}
