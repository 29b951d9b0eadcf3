//! Link state machine.
//!
//! Owns the whole life of a session with the aircraft: discovery,
//! connection, GATT precondition checks, notification arming, the
//! bind/unbind handshake, the best-effort control stream, and periodic
//! signal-strength polling. Every fatal condition funnels through one
//! disconnect-with-reason path; a torn-down session is rebuilt by
//! connecting again, never repaired in place.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::domain::control::ControlListener;
use crate::domain::fanout::Listeners;
use crate::domain::models::{ScannedDevice, StatusMessage};
use crate::domain::settings::Settings;
use crate::infrastructure::link::channel::{CommandChannel, Completion, Submit};
use crate::infrastructure::link::protocol::{self, Command, PeerResponse};
use crate::infrastructure::link::transport::{
    GattEvent, GattInventory, GattTransport, GATT_SUCCESS,
};

/// Session mode. One value at a time; transitions happen only in response
/// to user operations and transport events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    Disconnected,
    Connecting,
    ServiceDiscovery,
    Unbound,
    Binding,
    Bound,
    Unbinding,
}

/// Identifies one scheduled poll. A tick carrying a superseded token is
/// ignored, so a cancelled timer cannot fire into a newer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken(pub u64);

/// Delayed-tick source for the RSSI poll. A fired tick must come back
/// through the control loop as a call to [`QuadLink::rssi_poll_due`].
pub trait PollScheduler {
    fn schedule(&mut self, delay: Duration) -> TimerToken;
    fn cancel(&mut self, token: TimerToken);
}

/// Receives signal-strength changes. `None` means no valid reading.
pub trait RssiListener {
    fn on_rssi_update(&mut self, rssi: Option<i16>);
}

/// The UI shell as seen from the link. Callbacks arrive on the control
/// thread; implementations should hand off to their own context instead of
/// calling back into the link synchronously.
pub trait LinkShell {
    fn link_connecting(&mut self);
    /// Connected, services checked, notifications armed: ready to bind.
    fn link_ready(&mut self);
    fn link_bound(&mut self);
    fn link_disconnected(&mut self);
    fn device_found(&mut self, device: &ScannedDevice);
    fn status(&mut self, message: StatusMessage);
}

/// Link parameters, resolved from settings.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub service_uuid: u128,
    pub write_char_uuid: u128,
    pub notify_char_uuid: u128,
    pub rssi_interval: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            service_uuid: protocol::SERVICE_UUID,
            write_char_uuid: protocol::WRITE_CHAR_UUID,
            notify_char_uuid: protocol::NOTIFY_CHAR_UUID,
            rssi_interval: Duration::from_millis(1000),
        }
    }
}

impl LinkConfig {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self {
            service_uuid: protocol::parse_uuid(&settings.ble_service_uuid)?,
            write_char_uuid: protocol::parse_uuid(&settings.ble_write_char_uuid)?,
            notify_char_uuid: protocol::parse_uuid(&settings.ble_notify_char_uuid)?,
            rssi_interval: Duration::from_millis(settings.rssi_interval_ms),
        })
    }
}

pub struct QuadLink<T, S> {
    transport: T,
    scheduler: S,
    shell: Rc<RefCell<dyn LinkShell>>,
    config: LinkConfig,
    channel: CommandChannel,
    mode: LinkMode,
    scanning: bool,
    rssi: Option<i16>,
    rssi_timer: Option<TimerToken>,
    rssi_listeners: Listeners<dyn RssiListener>,
}

impl<T: GattTransport, S: PollScheduler> QuadLink<T, S> {
    pub fn new(
        transport: T,
        scheduler: S,
        shell: Rc<RefCell<dyn LinkShell>>,
        config: LinkConfig,
    ) -> Self {
        let channel = CommandChannel::new(config.write_char_uuid);
        Self {
            transport,
            scheduler,
            shell,
            config,
            channel,
            mode: LinkMode::Disconnected,
            scanning: false,
            rssi: None,
            rssi_timer: None,
            rssi_listeners: Listeners::new(),
        }
    }

    pub fn mode(&self) -> LinkMode {
        self.mode
    }

    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    pub fn add_rssi_listener(&mut self, listener: Rc<RefCell<dyn RssiListener>>) {
        self.rssi_listeners.add(listener);
    }

    pub fn remove_rssi_listener(&mut self, listener: &Rc<RefCell<dyn RssiListener>>) {
        self.rssi_listeners.remove(listener);
    }

    pub fn start_scan(&mut self) {
        if self.scanning {
            return;
        }

        match self.transport.start_scan(self.config.service_uuid) {
            Ok(()) => self.scanning = true,
            Err(e) => self.show_error(format!("Failed to start the scan: {e:#}")),
        }
    }

    pub fn stop_scan(&mut self) {
        if self.scanning {
            self.transport.stop_scan();
            self.scanning = false;
        }
    }

    pub fn connect(&mut self, device: &ScannedDevice) {
        if self.mode != LinkMode::Disconnected {
            warn!("connect requested while {:?}; ignoring", self.mode);
            return;
        }

        info!("connecting to '{}' ({:#014x})", device.name, device.address);
        self.stop_scan();
        self.mode = LinkMode::Connecting;
        self.shell.borrow_mut().link_connecting();

        if let Err(e) = self.transport.connect(device.address) {
            self.fault(format!("A connection error occurred: {e:#}"));
        }
    }

    pub fn bind(&mut self) {
        if self.mode != LinkMode::Unbound {
            warn!("bind requested while {:?}; ignoring", self.mode);
            return;
        }

        self.mode = LinkMode::Binding;
        if self.channel.submit(&Command::Bind, &mut self.transport) != Submit::Sent {
            self.fault("Failed to write the bind command.");
        }
    }

    pub fn unbind(&mut self) {
        match self.mode {
            LinkMode::Binding | LinkMode::Bound | LinkMode::Unbinding => {
                if self.channel.is_write_pending() {
                    // Switching mode first keeps further control frames off
                    // the wire; the completion hook sends the unbind.
                    self.mode = LinkMode::Unbinding;
                    self.channel.queue_unbind();
                } else {
                    match self.channel.submit(&Command::Unbind, &mut self.transport) {
                        Submit::Sent => self.mode = LinkMode::Unbound,
                        Submit::Busy | Submit::Failed => {
                            self.fault("Failed to write the unbind command.")
                        }
                    }
                }
            }
            // Nothing is armed; an unbind request here means "let go".
            LinkMode::Disconnected
            | LinkMode::Connecting
            | LinkMode::ServiceDiscovery
            | LinkMode::Unbound => self.disconnect(),
        }
    }

    /// Universal cancellation: poll timer off, RSSI invalidated, shell told,
    /// transport released. Idempotent.
    pub fn disconnect(&mut self) {
        if self.mode == LinkMode::Disconnected {
            return;
        }

        if let Some(token) = self.rssi_timer.take() {
            self.scheduler.cancel(token);
        }
        self.rssi = None;
        self.notify_rssi();

        self.shell.borrow_mut().link_disconnected();
        self.transport.close();
        self.channel.reset();
        self.mode = LinkMode::Disconnected;

        info!("link torn down");
    }

    pub fn handle_event(&mut self, event: GattEvent) {
        match event {
            GattEvent::DeviceFound(device) => {
                self.shell.borrow_mut().device_found(&device);
            }
            GattEvent::Connected => self.on_connected(),
            GattEvent::Disconnected => {
                // Silent when we asked for it; everything else is surfaced.
                if self.mode != LinkMode::Disconnected {
                    self.fault("Disconnected.");
                }
            }
            GattEvent::ConnectionError { status } => {
                if self.mode != LinkMode::Disconnected {
                    self.fault(format!("A connection error occurred: {status}"));
                }
            }
            GattEvent::ServicesDiscovered { status, inventory } => {
                self.on_services_discovered(status, &inventory)
            }
            GattEvent::DescriptorWritten { status } => self.on_descriptor_written(status),
            GattEvent::WriteCompleted { status } => self.on_write_completed(status),
            GattEvent::Notification { payload } => self.on_notification(&payload),
            GattEvent::RssiRead { status, rssi } => self.on_rssi_read(status, rssi),
        }
    }

    /// The previous poll's tick. Stale tokens are dropped.
    pub fn rssi_poll_due(&mut self, token: TimerToken) {
        if self.rssi_timer != Some(token) {
            debug!("stale poll tick {:?}; ignoring", token);
            return;
        }

        if let Err(e) = self.transport.read_rssi() {
            // No read means no completion event; reschedule from here so the
            // poll survives a hiccup.
            warn!("rssi read failed to start: {e:#}");
            self.rssi_timer = Some(self.scheduler.schedule(self.config.rssi_interval));
        }
    }

    fn on_connected(&mut self) {
        if self.mode != LinkMode::Connecting {
            debug!("connected event while {:?}; ignoring", self.mode);
            return;
        }
        self.mode = LinkMode::ServiceDiscovery;

        if let Err(e) = self.transport.request_high_priority() {
            self.fault(format!("Failed to set connection priority: {e:#}"));
            return;
        }

        if let Err(e) = self.transport.discover_services() {
            self.fault(format!("Failed to start service discovery: {e:#}"));
            return;
        }

        self.rssi_timer = Some(self.scheduler.schedule(self.config.rssi_interval));
    }

    fn on_services_discovered(&mut self, status: i32, inventory: &GattInventory) {
        if self.mode != LinkMode::ServiceDiscovery {
            debug!("service discovery result while {:?}; ignoring", self.mode);
            return;
        }

        if status != GATT_SUCCESS {
            self.fault(format!("The service discovery failed with status: {status}"));
            return;
        }

        let Some(service) = inventory.service(self.config.service_uuid) else {
            self.fault("Could not get the control service from the GATT server.");
            return;
        };

        let Some(write_char) = service.characteristic(self.config.write_char_uuid) else {
            self.fault("Could not get the write characteristic from the GATT server.");
            return;
        };

        if !write_char.write_without_response {
            self.fault("Write without response is not available for the write characteristic.");
            return;
        }

        let Some(notify_char) = service.characteristic(self.config.notify_char_uuid) else {
            self.fault("Could not get the notify characteristic from the GATT server.");
            return;
        };

        if !notify_char.supports_notify {
            self.fault("Notifications are not available for the notify characteristic.");
            return;
        }

        if let Err(e) = self.transport.subscribe(self.config.notify_char_uuid) {
            self.fault(format!(
                "Could not enable notifications for the notify characteristic: {e:#}"
            ));
            return;
        }

        if !notify_char.has_descriptor(protocol::CCCD_UUID) {
            self.fault("Failed to find the notification descriptor for the notify characteristic.");
            return;
        }

        if let Err(e) = self.transport.write_descriptor(
            self.config.notify_char_uuid,
            protocol::CCCD_UUID,
            &protocol::ENABLE_NOTIFICATIONS,
        ) {
            self.fault(format!("Failed to write the notification descriptor: {e:#}"));
            return;
        }

        if let Err(e) = self.transport.request_high_priority() {
            self.fault(format!("Failed to request high connection priority: {e:#}"));
            return;
        }

        // The session advances once the descriptor write is acknowledged.
        self.channel.reset();
    }

    fn on_descriptor_written(&mut self, status: i32) {
        if self.mode != LinkMode::ServiceDiscovery {
            debug!("descriptor result while {:?}; ignoring", self.mode);
            return;
        }

        if status == GATT_SUCCESS {
            self.mode = LinkMode::Unbound;
            self.shell.borrow_mut().link_ready();
        } else {
            self.fault("Failed to enable notifications on the notify characteristic.");
        }
    }

    fn on_notification(&mut self, payload: &[u8]) {
        if self.mode == LinkMode::Disconnected {
            debug!("notification while disconnected; ignoring");
            return;
        }

        match PeerResponse::decode(payload) {
            Ok(PeerResponse::Bound) => {
                if self.mode == LinkMode::Binding {
                    self.mode = LinkMode::Bound;
                    self.shell.borrow_mut().link_bound();
                } else {
                    debug!("bound response while {:?}; ignoring", self.mode);
                }
            }
            Ok(PeerResponse::Error) => self.fault("Error notification received."),
            // The peer is letting go; expected teardown, not an error.
            Ok(PeerResponse::Unbound) => self.disconnect(),
            Err(e) => self.fault(e.to_string()),
        }
    }

    fn on_write_completed(&mut self, status: i32) {
        if self.mode == LinkMode::Disconnected {
            debug!("write completion while disconnected; ignoring");
            return;
        }

        if status != GATT_SUCCESS {
            self.fault("A characteristic write failed!");
            return;
        }

        if self.mode == LinkMode::Unbinding {
            self.mode = LinkMode::Unbound;
        }

        match self.channel.complete_write(&mut self.transport) {
            Completion::Idle | Completion::UnbindChained => {}
            Completion::UnbindFailed => self.fault("Failed to write the unbind command."),
        }
    }

    fn on_rssi_read(&mut self, status: i32, rssi: i16) {
        if self.mode == LinkMode::Disconnected {
            return;
        }

        if status == GATT_SUCCESS {
            self.rssi = Some(rssi);
            self.notify_rssi();
        }

        // Rescheduled from here and only here, so a slow poll stretches the
        // period instead of piling reads up.
        self.rssi_timer = Some(self.scheduler.schedule(self.config.rssi_interval));
    }

    fn notify_rssi(&self) {
        let rssi = self.rssi;
        self.rssi_listeners.notify(|l| l.on_rssi_update(rssi));
    }

    fn show_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{message}");
        self.shell.borrow_mut().status(StatusMessage::error(message));
    }

    /// Every fatal fault comes through here: one diagnostic, full teardown.
    fn fault(&mut self, message: impl Into<String>) {
        self.show_error(message);
        self.disconnect();
    }
}

impl<T: GattTransport, S: PollScheduler> ControlListener for QuadLink<T, S> {
    fn on_control_update(&mut self, throttle: u8, pitch: i8, roll: i8, yaw: i8, _bound: bool) {
        if self.mode != LinkMode::Bound {
            return;
        }

        let command = Command::Control {
            throttle,
            pitch,
            roll,
            yaw,
        };
        match self.channel.submit(&command, &mut self.transport) {
            Submit::Sent => {}
            // A frame with fresher values follows shortly; dropping this one
            // keeps the stream most-recent-wins.
            Submit::Busy => {}
            Submit::Failed => self.fault("Failed to write the control command."),
        }
    }
}
