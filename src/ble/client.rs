//! BLE central client: connection state machine.
//!
//! The client is driven from outside by two calls:
//! - [`Client::handle_event`] for every event delivered by the stack, in
//!   arrival order, never re-entrantly.
//! - [`Client::poll`] periodically, to expire per-state timeouts and to
//!   fire delayed reconnection attempts.
//!
//! Handler errors are logged and counted instead of being returned. Once
//! more than [`ERROR_CEILING`] have accumulated since the last recovery,
//! the radio is power-cycled and the client returns to Idle.

use embedded_hal::delay::DelayNs;
use heapless::Vec;

use crate::ble::adv_parser;
use crate::ble::discovery::{Discovery, Failure, Outcome};
use crate::ble::matcher::Target;
use crate::ble::state::{ConnectionState, StateTracker};
use crate::ble::{Address, AddressString, BleStack, DiscoveredDevice, Event, GattProfile};
use crate::config::{Config, ERROR_CEILING, MAX_WRITE_LEN, RESET_PAUSE_MS, SCAN_GRACE_MS};
use crate::error::{Error, StackError};
use crate::health::{Health, HealthMonitor, Headroom};

/// Session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Stats {
    pub connections: u32,
    pub disconnections: u32,
    pub notifications: u32,
    pub reads: u32,
    pub errors: u32,
    pub devices_scanned: u32,
}

/// Snapshot returned by [`Client::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Status {
    pub state: ConnectionState,
    pub connected: bool,
    pub ready: bool,
    pub target_found: bool,
    pub device: Option<AddressString>,
    pub notifications: bool,
    pub retry_count: u8,
    pub last_value: Option<u16>,
    pub restart_required: bool,
    pub health: Health,
    pub stats: Stats,
}

pub struct Client<S, M, D> {
    stack: S,
    health: HealthMonitor<M>,
    delay: D,
    config: Config,
    target: Target,
    state: StateTracker,
    conn: Option<u16>,
    /// Handle of the link the client dropped last; late events for it are ignored.
    dropped: Option<u16>,
    device: Option<DiscoveredDevice>,
    discovery: Discovery,
    scan_budget_ms: u32,
    retry_count: u8,
    error_count: u32,
    stats: Stats,
    read_pending_since: Option<u64>,
    last_value: Option<u16>,
    last_payload: Vec<u8, MAX_WRITE_LEN>,
    restart_required: bool,
}

impl<S, M, D> Client<S, M, D>
where
    S: BleStack,
    M: Headroom,
    D: DelayNs,
{
    pub fn new(stack: S, memory: M, delay: D, config: Config, target: Target) -> Self {
        let health = HealthMonitor::new(memory, config.memory_threshold, config.reclaim_interval);
        Self {
            stack,
            health,
            delay,
            scan_budget_ms: config.scan_duration_ms,
            config,
            target,
            state: StateTracker::new(0),
            conn: None,
            dropped: None,
            device: None,
            discovery: Discovery::new(GattProfile::default()),
            retry_count: 0,
            error_count: 0,
            stats: Stats::default(),
            read_pending_since: None,
            last_value: None,
            last_payload: Vec::new(),
            restart_required: false,
        }
    }

    /// Walk a different service/characteristic pair during discovery.
    pub fn with_profile(mut self, profile: GattProfile) -> Self {
        self.discovery = Discovery::new(profile);
        self
    }

    /// Check headroom, then bring the radio up and enter Idle.
    pub fn init(&mut self, now_ms: u64) -> Result<(), Error> {
        self.health.check_init(now_ms)?;
        self.stack.set_active(true)?;
        self.stack.attach_events()?;
        self.state.set(ConnectionState::Idle, now_ms);
        info!("BLE client initialized");
        Ok(())
    }

    /// Drop the link, stop scanning and power the radio down.
    pub fn shutdown(&mut self, now_ms: u64) -> Result<(), Error> {
        self.config.auto_reconnect = false;
        if self.state.current() == ConnectionState::Scanning {
            self.stack.stop_scan()?;
        }
        if let Some(conn) = self.conn {
            self.stack.disconnect(conn)?;
        }
        self.clear_link();
        self.stack.set_active(false)?;
        self.state.set(ConnectionState::Idle, now_ms);
        info!("BLE client shut down");
        Ok(())
    }

    /// Return to Idle from any state, dropping the link if there is one.
    pub fn reset(&mut self, now_ms: u64) {
        if let Some(conn) = self.conn {
            if let Err(e) = self.stack.disconnect(conn) {
                warn!("Disconnect during reset failed: {:?}", e);
            }
        }
        self.clear_link();
        self.state.set(ConnectionState::Idle, now_ms);
    }

    // ═══════════════════════════════════════════════════════════════════
    // Commands
    // ═══════════════════════════════════════════════════════════════════

    /// Scan for the configured duration.
    pub fn scan(&mut self, now_ms: u64) -> Result<(), Error> {
        self.scan_for(self.config.scan_duration_ms, now_ms)
    }

    /// Scan for `duration_ms`. Only allowed from Idle or Error.
    pub fn scan_for(&mut self, duration_ms: u32, now_ms: u64) -> Result<(), Error> {
        let state = self.state.current();
        if !state.can_scan() {
            warn!("Scan rejected in state {}", state.as_str());
            return Err(Error::InvalidState(state));
        }
        self.device = None;
        self.stats.devices_scanned = 0;
        self.clear_link();
        self.stack.start_scan(duration_ms)?;
        self.scan_budget_ms = duration_ms;
        self.state.set(ConnectionState::Scanning, now_ms);
        info!("Scanning for {} ms", duration_ms);
        self.health.maybe_reclaim(&mut self.delay, true, now_ms);
        Ok(())
    }

    /// Issue a read of the target characteristic. The value arrives as an event.
    pub fn read(&mut self, now_ms: u64) -> Result<(), Error> {
        let (conn, handle) = self.ready_link()?;
        self.stack.read(conn, handle)?;
        self.read_pending_since = Some(now_ms);
        Ok(())
    }

    /// Write `data` to the target characteristic.
    pub fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        let (conn, handle) = self.ready_link()?;
        if data.len() > MAX_WRITE_LEN {
            return Err(Error::PayloadTooLarge {
                len: data.len(),
                max: MAX_WRITE_LEN,
            });
        }
        self.stack.write_characteristic(conn, handle, data)?;
        Ok(())
    }

    /// Drop the link and stop reconnecting.
    ///
    /// Without a link, a pending or scheduled connection attempt is
    /// abandoned instead; a late `Connected` for it is dropped on arrival.
    pub fn disconnect(&mut self) -> Result<(), Error> {
        self.config.auto_reconnect = false;
        match (self.conn, self.state.current()) {
            (Some(conn), _) => {
                info!("Disconnecting {}", conn);
                self.stack.disconnect(conn)?;
                Ok(())
            }
            (None, ConnectionState::Connecting | ConnectionState::Reconnecting) => {
                info!("Connection attempt abandoned");
                // Idle runs no timers, so the entry time is nominal.
                let since = self.state.entered_at();
                self.state.set(ConnectionState::Idle, since);
                Ok(())
            }
            (None, _) => Err(Error::NotReady),
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════

    /// Ready state, known value handle and known connection handle.
    pub fn is_ready(&self) -> bool {
        self.ready_link().is_ok()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.current()
    }

    pub fn previous_state(&self) -> ConnectionState {
        self.state.previous()
    }

    pub fn device(&self) -> Option<&DiscoveredDevice> {
        self.device.as_ref()
    }

    pub fn retry_count(&self) -> u8 {
        self.retry_count
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn notifications_enabled(&self) -> bool {
        self.discovery.notifications()
    }

    /// First two bytes of the last value read or notified, little-endian.
    pub fn last_value(&self) -> Option<u16> {
        self.last_value
    }

    pub fn last_payload(&self) -> &[u8] {
        &self.last_payload
    }

    /// The radio could not be reset; only a full restart helps now.
    pub fn restart_required(&self) -> bool {
        self.restart_required
    }

    pub fn stack(&self) -> &S {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut S {
        &mut self.stack
    }

    #[cfg(test)]
    pub(crate) fn delay(&self) -> &D {
        &self.delay
    }

    pub fn status(&mut self) -> Status {
        Status {
            state: self.state.current(),
            connected: self.conn.is_some(),
            ready: self.is_ready(),
            target_found: self.device.is_some(),
            device: self.device.as_ref().map(|d| d.address_str.clone()),
            notifications: self.discovery.notifications(),
            retry_count: self.retry_count,
            last_value: self.last_value,
            restart_required: self.restart_required,
            health: self.health.health(),
            stats: self.stats,
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Event handling
    // ═══════════════════════════════════════════════════════════════════

    /// Process one stack event. Never fails; errors are counted.
    pub fn handle_event(&mut self, event: &Event<'_>, now_ms: u64) {
        self.health.on_operation();

        if let Err(e) = self.dispatch(event, now_ms) {
            warn!("Event handler error: {:?}", e);
            self.stats.errors = self.stats.errors.wrapping_add(1);
            self.error_count += 1;
            if self.error_count > ERROR_CEILING {
                self.recover(now_ms);
            }
        }

        self.health.maybe_reclaim(&mut self.delay, false, now_ms);
    }

    /// Expire timeouts and fire delayed reconnects.
    pub fn poll(&mut self, now_ms: u64) {
        let elapsed = self.state.elapsed(now_ms);
        match self.state.current() {
            ConnectionState::Scanning => {
                if elapsed > u64::from(self.scan_budget_ms) + u64::from(SCAN_GRACE_MS) {
                    warn!("Scan did not complete, stopping");
                    if let Err(e) = self.stack.stop_scan() {
                        warn!("Stop scan failed: {:?}", e);
                    }
                    self.state.set(ConnectionState::Idle, now_ms);
                }
            }
            ConnectionState::Connecting => {
                if elapsed > u64::from(self.config.connection_timeout_ms) {
                    warn!("Connection attempt timed out");
                    self.after_link_loss(now_ms);
                }
            }
            ConnectionState::Connected | ConnectionState::Discovering => {
                if elapsed > u64::from(self.config.discovery_timeout_ms) {
                    error!("Service discovery timed out");
                    self.fail(now_ms);
                }
            }
            ConnectionState::Reconnecting => {
                if !self.config.auto_reconnect {
                    self.state.set(ConnectionState::Idle, now_ms);
                } else if elapsed >= u64::from(self.config.retry_delay_ms) {
                    if let Err(e) = self.begin_connect(now_ms) {
                        warn!("Reconnect failed: {:?}", e);
                        self.stats.errors = self.stats.errors.wrapping_add(1);
                    }
                }
            }
            ConnectionState::Ready => {
                if let Some(since) = self.read_pending_since {
                    if now_ms.saturating_sub(since) > u64::from(self.config.read_timeout_ms) {
                        warn!("Read timed out");
                        self.read_pending_since = None;
                        self.stats.errors = self.stats.errors.wrapping_add(1);
                    }
                }
            }
            ConnectionState::Idle | ConnectionState::Error => {}
        }
    }

    fn dispatch(&mut self, event: &Event<'_>, now_ms: u64) -> Result<(), Error> {
        match event {
            Event::ScanResult { address, rssi, data } => {
                self.on_scan_result(address, *rssi, data, now_ms)
            }
            Event::ScanDone => {
                if self.state.current() == ConnectionState::Scanning {
                    info!(
                        "Scan complete, target not found ({} devices)",
                        self.stats.devices_scanned
                    );
                    self.state.set(ConnectionState::Idle, now_ms);
                }
                Ok(())
            }
            Event::Connected { conn, .. } => self.on_connected(*conn, now_ms),
            Event::Disconnected { conn, .. } => {
                self.on_disconnected(*conn, now_ms);
                Ok(())
            }
            gatt => {
                let conn = gatt.gatt_conn().unwrap_or_default();
                if self.conn == Some(conn) {
                    self.on_gatt(gatt, conn, now_ms)
                } else if self.conn.is_none() || self.dropped == Some(conn) {
                    debug!("Ignoring late event for dropped handle {}", conn);
                    Ok(())
                } else {
                    Err(Error::ForeignConnection(conn))
                }
            }
        }
    }

    fn on_scan_result(
        &mut self,
        address: &Address,
        rssi: i8,
        data: &[u8],
        now_ms: u64,
    ) -> Result<(), Error> {
        if self.state.current() != ConnectionState::Scanning {
            return Ok(());
        }
        self.stats.devices_scanned = self.stats.devices_scanned.wrapping_add(1);
        if rssi < self.config.rssi_threshold {
            return Ok(());
        }

        let adv = adv_parser::parse(data);
        let address_str = address.to_hex_string();
        debug!(
            "Scanned {} rssi={} name={:?}",
            address_str.as_str(),
            rssi,
            adv.name.as_deref()
        );
        if !self
            .target
            .matches(&address_str, adv.name.as_deref(), &adv.services)
        {
            return Ok(());
        }

        info!("Target found: {} ({} dBm)", address_str.as_str(), rssi);
        self.device = Some(DiscoveredDevice {
            address: *address,
            rssi,
            name: adv.name,
            address_str,
        });
        if let Err(e) = self.stack.stop_scan() {
            warn!("Stop scan failed: {:?}", e);
        }
        self.retry_count = 0;
        self.begin_connect(now_ms)
    }

    fn begin_connect(&mut self, now_ms: u64) -> Result<(), Error> {
        let address = self.device.as_ref().ok_or(Error::NotReady)?.address;
        match self.stack.connect(&address) {
            Ok(()) => {
                self.state.set(ConnectionState::Connecting, now_ms);
                Ok(())
            }
            Err(e) => {
                self.state.set(ConnectionState::Error, now_ms);
                Err(e.into())
            }
        }
    }

    fn on_connected(&mut self, conn: u16, now_ms: u64) -> Result<(), Error> {
        if self.state.current() != ConnectionState::Connecting {
            warn!("Unexpected connection {}, dropping it", conn);
            self.stack.disconnect(conn)?;
            return Ok(());
        }

        info!("Connected: handle {}", conn);
        self.conn = Some(conn);
        self.retry_count = 0;
        self.stats.connections = self.stats.connections.wrapping_add(1);
        self.state.set(ConnectionState::Connected, now_ms);

        match self.discovery.start(&mut self.stack, conn) {
            Ok(()) => {
                self.state.set(ConnectionState::Discovering, now_ms);
                Ok(())
            }
            Err(e) => {
                self.fail(now_ms);
                Err(e.into())
            }
        }
    }

    fn on_disconnected(&mut self, conn: u16, now_ms: u64) {
        match self.conn {
            Some(active) if active == conn => {
                info!("Disconnected: handle {}", conn);
                self.stats.disconnections = self.stats.disconnections.wrapping_add(1);
            }
            Some(_) => {
                debug!("Ignoring disconnect of foreign handle {}", conn);
                return;
            }
            None if self.state.current() == ConnectionState::Connecting => {
                warn!("Connection attempt failed");
            }
            None => {
                debug!("Ignoring disconnect without a link");
                return;
            }
        }
        self.clear_link();
        self.after_link_loss(now_ms);
    }

    fn on_gatt(&mut self, event: &Event<'_>, conn: u16, now_ms: u64) -> Result<(), Error> {
        let discovering = self.state.current() == ConnectionState::Discovering;
        let outcome = match event {
            Event::ServiceFound {
                uuid, start, end, ..
            } if discovering => {
                self.discovery.on_service_found(uuid, *start, *end);
                Outcome::Pending
            }
            Event::ServiceDone { .. } if discovering => {
                self.discovery.on_service_done(&mut self.stack, conn)
            }
            Event::CharacteristicFound { uuid, value, .. } if discovering => {
                self.discovery.on_characteristic_found(uuid, *value);
                Outcome::Pending
            }
            Event::CharacteristicDone { .. } if discovering => {
                self.discovery.on_characteristic_done(&mut self.stack, conn)
            }
            Event::DescriptorFound { handle, uuid, .. } if discovering => {
                self.discovery
                    .on_descriptor_found(&mut self.stack, conn, *handle, uuid)
            }
            Event::DescriptorDone { .. } if discovering => self.discovery.on_descriptor_done(),
            Event::ReadResult { handle, data, .. } => {
                if Some(*handle) == self.discovery.value_handle() {
                    self.stats.reads = self.stats.reads.wrapping_add(1);
                    self.record_value(data);
                }
                Outcome::Pending
            }
            Event::ReadDone { handle, status, .. } => {
                self.read_pending_since = None;
                if *status != 0 {
                    warn!("Read of handle {} failed: status {}", handle, status);
                    return Err(StackError::Raw(u32::from(*status)).into());
                }
                Outcome::Pending
            }
            Event::WriteDone { handle, status, .. } => {
                if *status != 0 {
                    warn!("Write to handle {} failed: status {}", handle, status);
                    if Some(*handle) == self.discovery.handles().cccd {
                        self.discovery.notifications_rejected();
                    }
                }
                Outcome::Pending
            }
            Event::Notify { handle, data, .. } => {
                if Some(*handle) == self.discovery.value_handle() {
                    self.stats.notifications = self.stats.notifications.wrapping_add(1);
                    self.record_value(data);
                }
                Outcome::Pending
            }
            _ => Outcome::Pending,
        };
        self.apply(outcome, now_ms)
    }

    fn apply(&mut self, outcome: Outcome, now_ms: u64) -> Result<(), Error> {
        match outcome {
            Outcome::Pending => Ok(()),
            Outcome::Ready { notifications } => {
                self.state.set(ConnectionState::Ready, now_ms);
                if notifications {
                    info!("Ready, notifications enabled");
                } else {
                    info!("Ready without notifications");
                }
                Ok(())
            }
            Outcome::Failed(Failure::Stack(e)) => {
                self.fail(now_ms);
                Err(e.into())
            }
            Outcome::Failed(f) => {
                error!("Discovery failed: {:?}", f);
                self.fail(now_ms);
                Ok(())
            }
        }
    }

    fn record_value(&mut self, data: &[u8]) {
        self.last_payload.clear();
        let n = data.len().min(MAX_WRITE_LEN);
        let _ = self.last_payload.extend_from_slice(&data[..n]);
        if let [lo, hi, ..] = *data {
            self.last_value = Some(u16::from_le_bytes([lo, hi]));
        }
    }

    /// Decide between Reconnecting and Idle after losing (or failing to
    /// establish) a link.
    fn after_link_loss(&mut self, now_ms: u64) {
        let remembered = self.device.is_some();
        if self.config.auto_reconnect && remembered && self.retry_count < self.config.max_retries {
            self.retry_count += 1;
            info!(
                "Reconnecting in {} ms (attempt {}/{})",
                self.config.retry_delay_ms,
                self.retry_count,
                self.config.max_retries
            );
            self.state.set(ConnectionState::Reconnecting, now_ms);
        } else {
            if self.config.auto_reconnect && remembered {
                warn!("Giving up after {} reconnection attempts", self.retry_count);
            }
            self.state.set(ConnectionState::Idle, now_ms);
        }
    }

    /// Enter Error, dropping the link if one is up.
    fn fail(&mut self, now_ms: u64) {
        if let Some(conn) = self.conn {
            if let Err(e) = self.stack.disconnect(conn) {
                warn!("Disconnect failed: {:?}", e);
            }
            self.stats.disconnections = self.stats.disconnections.wrapping_add(1);
        }
        self.clear_link();
        self.state.set(ConnectionState::Error, now_ms);
    }

    fn clear_link(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.dropped = Some(conn);
        }
        self.discovery.clear();
        self.read_pending_since = None;
    }

    fn ready_link(&self) -> Result<(u16, u16), Error> {
        if self.state.current() != ConnectionState::Ready {
            return Err(Error::NotReady);
        }
        match (self.conn, self.discovery.value_handle()) {
            (Some(conn), Some(handle)) => Ok((conn, handle)),
            _ => Err(Error::NotReady),
        }
    }

    fn recover(&mut self, now_ms: u64) {
        error!("{} handler errors, resetting radio", self.error_count);
        match self.reset_stack(now_ms) {
            Ok(()) => {
                self.error_count = 0;
                self.health.maybe_reclaim(&mut self.delay, true, now_ms);
                info!("Radio reset complete");
            }
            Err(e) => {
                error!("Radio reset failed: {:?}, restart required", e);
                self.restart_required = true;
            }
        }
    }

    fn reset_stack(&mut self, now_ms: u64) -> Result<(), StackError> {
        self.stack.set_active(false)?;
        self.delay.delay_ms(RESET_PAUSE_MS);
        self.stack.set_active(true)?;
        self.stack.attach_events()?;
        self.clear_link();
        self.state.set(ConnectionState::Idle, now_ms);
        Ok(())
    }
}
