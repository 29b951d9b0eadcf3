//! Control-loop service.
//!
//! One dedicated thread owns every mutable piece: the motion tracker, the
//! control model, and the link state machine. User input, transport
//! callbacks, and poll ticks are funneled into a single queue and applied
//! one at a time, so nothing in the crate needs a lock.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::domain::control::{ControlListener, QuadModel};
use crate::domain::models::{LinkStatus, LinkUpdate, MotionSample, ScannedDevice, StatusMessage};
use crate::domain::motion::{MotionListener, MotionTracker};
use crate::domain::settings::Settings;
use crate::infrastructure::link::state::{
    LinkConfig, LinkShell, PollScheduler, QuadLink, RssiListener, TimerToken,
};
use crate::infrastructure::link::transport::{GattEvent, GattTransport};

/// Host capability probes, checked once at startup.
pub trait HostCapabilities {
    fn has_ble_radio(&self) -> bool;
    fn has_motion_sensor(&self) -> bool;
}

/// A capability the whole session cannot run without.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PreflightError {
    #[error("This device does not support BLE.")]
    NoRadio,
    #[error("No accelerometer detected.")]
    NoMotionSensor,
}

/// Terminal precondition check; run before [`spawn`].
pub fn preflight(host: &dyn HostCapabilities) -> Result<(), PreflightError> {
    if !host.has_ble_radio() {
        return Err(PreflightError::NoRadio);
    }
    if !host.has_motion_sensor() {
        return Err(PreflightError::NoMotionSensor);
    }
    Ok(())
}

enum ServiceEvent {
    StartScan,
    StopScan,
    Connect(ScannedDevice),
    Bind,
    Unbind,
    Disconnect,
    ThrottleUp,
    ThrottleDown,
    Motion(MotionSample),
    Gatt(GattEvent),
    RssiTick(TimerToken),
    Shutdown,
}

/// Cloneable handle for driving the control loop from the UI and sensor
/// side. Every method is fire-and-forget; results come back on the
/// [`LinkUpdate`] stream.
#[derive(Clone)]
pub struct LinkHandle {
    events: mpsc::UnboundedSender<ServiceEvent>,
}

impl LinkHandle {
    pub fn start_scan(&self) {
        self.send(ServiceEvent::StartScan);
    }

    pub fn stop_scan(&self) {
        self.send(ServiceEvent::StopScan);
    }

    pub fn connect(&self, device: ScannedDevice) {
        self.send(ServiceEvent::Connect(device));
    }

    pub fn bind(&self) {
        self.send(ServiceEvent::Bind);
    }

    pub fn unbind(&self) {
        self.send(ServiceEvent::Unbind);
    }

    pub fn disconnect(&self) {
        self.send(ServiceEvent::Disconnect);
    }

    pub fn throttle_up(&self) {
        self.send(ServiceEvent::ThrottleUp);
    }

    pub fn throttle_down(&self) {
        self.send(ServiceEvent::ThrottleDown);
    }

    /// Feed one raw sample from the platform motion sensor.
    pub fn motion_sample(&self, sample: MotionSample) {
        self.send(ServiceEvent::Motion(sample));
    }

    /// Stop the control loop. The link is torn down on the way out.
    pub fn shutdown(&self) {
        self.send(ServiceEvent::Shutdown);
    }

    fn send(&self, event: ServiceEvent) {
        let _ = self.events.send(event);
    }
}

/// Poll scheduling on the control thread's runtime. At most one timer is
/// live; scheduling a new one replaces and aborts the previous.
struct TokioScheduler {
    events: mpsc::UnboundedSender<ServiceEvent>,
    next: u64,
    current: Option<(TimerToken, JoinHandle<()>)>,
}

impl TokioScheduler {
    fn new(events: mpsc::UnboundedSender<ServiceEvent>) -> Self {
        Self {
            events,
            next: 0,
            current: None,
        }
    }
}

impl PollScheduler for TokioScheduler {
    fn schedule(&mut self, delay: Duration) -> TimerToken {
        if let Some((_, handle)) = self.current.take() {
            handle.abort();
        }

        self.next += 1;
        let token = TimerToken(self.next);
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(ServiceEvent::RssiTick(token));
        });
        self.current = Some((token, handle));
        token
    }

    fn cancel(&mut self, token: TimerToken) {
        if let Some((current, handle)) = self.current.take() {
            if current == token {
                handle.abort();
            } else {
                self.current = Some((current, handle));
            }
        }
    }
}

/// Model follow-ups requested by shell callbacks. They are collected here
/// and applied by the loop only after the dispatch that produced them has
/// fully unwound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelAction {
    Bind,
    Reset,
}

struct ShellRelay {
    updates: mpsc::UnboundedSender<LinkUpdate>,
    actions: Rc<RefCell<Vec<ModelAction>>>,
}

impl ShellRelay {
    fn send(&self, update: LinkUpdate) {
        let _ = self.updates.send(update);
    }
}

impl LinkShell for ShellRelay {
    fn link_connecting(&mut self) {
        self.send(LinkUpdate::Status(LinkStatus::Connecting));
    }

    fn link_ready(&mut self) {
        self.send(LinkUpdate::Status(LinkStatus::Ready));
    }

    fn link_bound(&mut self) {
        self.actions.borrow_mut().push(ModelAction::Bind);
        self.send(LinkUpdate::Status(LinkStatus::Bound));
    }

    fn link_disconnected(&mut self) {
        self.actions.borrow_mut().push(ModelAction::Reset);
        self.send(LinkUpdate::Status(LinkStatus::Disconnected));
    }

    fn device_found(&mut self, device: &ScannedDevice) {
        self.send(LinkUpdate::DeviceFound(device.clone()));
    }

    fn status(&mut self, message: StatusMessage) {
        self.send(LinkUpdate::Message(message));
    }
}

/// Forwards fan-out deliveries to the outbound update stream, for the
/// rendering side.
struct UpdateRelay {
    updates: mpsc::UnboundedSender<LinkUpdate>,
}

impl MotionListener for UpdateRelay {
    fn on_motion(&mut self, x: f32, y: f32, z: f32, max_magnitude: f32) {
        let _ = self.updates.send(LinkUpdate::Motion {
            x,
            y,
            z,
            max_magnitude,
        });
    }
}

impl ControlListener for UpdateRelay {
    fn on_control_update(&mut self, throttle: u8, pitch: i8, roll: i8, yaw: i8, bound: bool) {
        let _ = self.updates.send(LinkUpdate::Control {
            throttle,
            pitch,
            roll,
            yaw,
            bound,
        });
    }
}

impl RssiListener for UpdateRelay {
    fn on_rssi_update(&mut self, rssi: Option<i16>) {
        let _ = self.updates.send(LinkUpdate::Rssi(rssi));
    }
}

/// Start the control loop on its own thread.
///
/// `factory` builds the platform transport and receives the sender the
/// transport must use to deliver its callbacks. The transport is created on
/// the control thread itself, so it does not need to be `Send` once built.
pub fn spawn<T, F>(
    factory: F,
    settings: &Settings,
) -> Result<(LinkHandle, mpsc::UnboundedReceiver<LinkUpdate>)>
where
    T: GattTransport + 'static,
    F: FnOnce(mpsc::UnboundedSender<GattEvent>) -> T + Send + 'static,
{
    let config = LinkConfig::from_settings(settings)?;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ServiceEvent>();
    let (update_tx, update_rx) = mpsc::unbounded_channel::<LinkUpdate>();
    let (gatt_tx, mut gatt_rx) = mpsc::unbounded_channel::<GattEvent>();

    let handle = LinkHandle {
        events: event_tx.clone(),
    };
    let gatt_forward_tx = event_tx.clone();

    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("Failed to create tokio runtime for the control loop");

        rt.block_on(async move {
            // Bridge transport callbacks into the single control queue.
            tokio::spawn(async move {
                while let Some(event) = gatt_rx.recv().await {
                    if gatt_forward_tx.send(ServiceEvent::Gatt(event)).is_err() {
                        break;
                    }
                }
            });

            let transport = factory(gatt_tx);
            let scheduler = TokioScheduler::new(event_tx);

            let actions = Rc::new(RefCell::new(Vec::new()));
            let shell: Rc<RefCell<dyn LinkShell>> = Rc::new(RefCell::new(ShellRelay {
                updates: update_tx.clone(),
                actions: actions.clone(),
            }));
            let relay = Rc::new(RefCell::new(UpdateRelay {
                updates: update_tx.clone(),
            }));

            let mut tracker = MotionTracker::new();
            let model = Rc::new(RefCell::new(QuadModel::new()));
            let link = Rc::new(RefCell::new(QuadLink::new(
                transport, scheduler, shell, config,
            )));

            // Rendering relay first, acting consumers second.
            tracker.add_listener(relay.clone());
            tracker.add_listener(model.clone());
            model.borrow_mut().add_listener(relay.clone());
            model.borrow_mut().add_listener(link.clone());
            link.borrow_mut().add_rssi_listener(relay.clone());

            info!("control loop running");

            while let Some(event) = event_rx.recv().await {
                match event {
                    ServiceEvent::StartScan => link.borrow_mut().start_scan(),
                    ServiceEvent::StopScan => link.borrow_mut().stop_scan(),
                    ServiceEvent::Connect(device) => link.borrow_mut().connect(&device),
                    ServiceEvent::Bind => link.borrow_mut().bind(),
                    ServiceEvent::Unbind => link.borrow_mut().unbind(),
                    ServiceEvent::Disconnect => link.borrow_mut().disconnect(),
                    ServiceEvent::ThrottleUp => model.borrow_mut().throttle_up(),
                    ServiceEvent::ThrottleDown => model.borrow_mut().throttle_down(),
                    ServiceEvent::Motion(sample) => tracker.submit_sample(sample),
                    ServiceEvent::Gatt(event) => link.borrow_mut().handle_event(event),
                    ServiceEvent::RssiTick(token) => link.borrow_mut().rssi_poll_due(token),
                    ServiceEvent::Shutdown => break,
                }

                // Shell callbacks never touch the model directly; whatever
                // they asked for runs here, after the dispatch above has
                // fully unwound. An action may queue further actions.
                loop {
                    let pending: Vec<ModelAction> = actions.borrow_mut().drain(..).collect();
                    if pending.is_empty() {
                        break;
                    }
                    for action in pending {
                        match action {
                            ModelAction::Bind => model.borrow_mut().bind(),
                            ModelAction::Reset => model.borrow_mut().reset(),
                        }
                    }
                }
            }

            link.borrow_mut().disconnect();
            info!("control loop stopped");
        });
    });

    Ok((handle, update_rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::MessageSeverity;
    use crate::infrastructure::link::protocol;
    use crate::infrastructure::link::transport::{
        GattCharacteristicInfo, GattInventory, GattServiceInfo, GATT_SUCCESS,
    };
    use tokio::time::timeout;

    struct Host {
        radio: bool,
        sensor: bool,
    }

    impl HostCapabilities for Host {
        fn has_ble_radio(&self) -> bool {
            self.radio
        }

        fn has_motion_sensor(&self) -> bool {
            self.sensor
        }
    }

    #[test]
    fn preflight_requires_radio_and_sensor() {
        let ok = Host {
            radio: true,
            sensor: true,
        };
        assert!(preflight(&ok).is_ok());

        let no_radio = Host {
            radio: false,
            sensor: true,
        };
        assert_eq!(preflight(&no_radio), Err(PreflightError::NoRadio));

        let no_sensor = Host {
            radio: true,
            sensor: false,
        };
        assert_eq!(preflight(&no_sensor), Err(PreflightError::NoMotionSensor));
    }

    /// A transport that plays the aircraft's side of the conversation: every
    /// request is answered immediately through the event sender.
    struct LoopbackTransport {
        events: mpsc::UnboundedSender<GattEvent>,
    }

    impl LoopbackTransport {
        fn emit(&self, event: GattEvent) {
            let _ = self.events.send(event);
        }

        fn inventory() -> GattInventory {
            GattInventory {
                services: vec![GattServiceInfo {
                    uuid: protocol::SERVICE_UUID,
                    characteristics: vec![
                        GattCharacteristicInfo {
                            uuid: protocol::WRITE_CHAR_UUID,
                            write_without_response: true,
                            supports_notify: false,
                            descriptors: vec![],
                        },
                        GattCharacteristicInfo {
                            uuid: protocol::NOTIFY_CHAR_UUID,
                            write_without_response: false,
                            supports_notify: true,
                            descriptors: vec![protocol::CCCD_UUID],
                        },
                    ],
                }],
            }
        }
    }

    impl GattTransport for LoopbackTransport {
        fn start_scan(&mut self, _service_uuid: u128) -> Result<()> {
            self.emit(GattEvent::DeviceFound(ScannedDevice {
                name: "QUAD-01".to_string(),
                address: 0xC0FFEE123456,
                signal_strength: -50,
            }));
            Ok(())
        }

        fn stop_scan(&mut self) {}

        fn connect(&mut self, _address: u64) -> Result<()> {
            self.emit(GattEvent::Connected);
            Ok(())
        }

        fn request_high_priority(&mut self) -> Result<()> {
            Ok(())
        }

        fn discover_services(&mut self) -> Result<()> {
            self.emit(GattEvent::ServicesDiscovered {
                status: GATT_SUCCESS,
                inventory: Self::inventory(),
            });
            Ok(())
        }

        fn subscribe(&mut self, _char_uuid: u128) -> Result<()> {
            Ok(())
        }

        fn write_descriptor(
            &mut self,
            _char_uuid: u128,
            _descriptor_uuid: u128,
            _value: &[u8],
        ) -> Result<()> {
            self.emit(GattEvent::DescriptorWritten {
                status: GATT_SUCCESS,
            });
            Ok(())
        }

        fn write_command(&mut self, _char_uuid: u128, payload: &[u8]) -> Result<()> {
            self.emit(GattEvent::WriteCompleted {
                status: GATT_SUCCESS,
            });
            match payload.first() {
                // The aircraft acknowledges the handshake commands.
                Some(0x00) => self.emit(GattEvent::Notification {
                    payload: vec![0x00],
                }),
                Some(0x02) => self.emit(GattEvent::Notification {
                    payload: vec![0x02],
                }),
                _ => {}
            }
            Ok(())
        }

        fn read_rssi(&mut self) -> Result<()> {
            self.emit(GattEvent::RssiRead {
                status: GATT_SUCCESS,
                rssi: -42,
            });
            Ok(())
        }

        fn close(&mut self) {}
    }

    async fn next_update(rx: &mut mpsc::UnboundedReceiver<LinkUpdate>) -> LinkUpdate {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for an update")
            .expect("update stream closed")
    }

    async fn next_status(rx: &mut mpsc::UnboundedReceiver<LinkUpdate>) -> LinkStatus {
        loop {
            match next_update(rx).await {
                LinkUpdate::Status(status) => return status,
                LinkUpdate::Message(m) if m.severity == MessageSeverity::Error => {
                    panic!("unexpected error: {}", m.message);
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn full_session_against_a_loopback_aircraft() {
        let settings = Settings::default();
        let (handle, mut updates) =
            spawn(|events| LoopbackTransport { events }, &settings).unwrap();

        // Discovery.
        handle.start_scan();
        let found = loop {
            if let LinkUpdate::DeviceFound(device) = next_update(&mut updates).await {
                break device;
            }
        };
        assert_eq!(found.name, "QUAD-01");

        // Connect straight through to ready.
        handle.connect(found);
        assert_eq!(next_status(&mut updates).await, LinkStatus::Connecting);
        assert_eq!(next_status(&mut updates).await, LinkStatus::Ready);

        // Bind: the loopback peer accepts, the model arms the throttle.
        handle.bind();
        assert_eq!(next_status(&mut updates).await, LinkStatus::Bound);
        let armed = loop {
            if let LinkUpdate::Control { bound, .. } = next_update(&mut updates).await {
                break bound;
            }
        };
        assert!(armed);

        // Tilt flows through to a control frame.
        handle.motion_sample(MotionSample {
            x: 0.5,
            y: 0.0,
            z: 0.0,
        });
        let yaw = loop {
            if let LinkUpdate::Control { yaw, .. } = next_update(&mut updates).await {
                break yaw;
            }
        };
        assert_eq!(yaw, 127);

        // Unbind: the peer confirms, the session tears down and the model
        // resets.
        handle.unbind();
        assert_eq!(next_status(&mut updates).await, LinkStatus::Disconnected);
        let reset = loop {
            match next_update(&mut updates).await {
                LinkUpdate::Control {
                    throttle,
                    pitch,
                    roll,
                    yaw,
                    bound,
                } => break (throttle, pitch, roll, yaw, bound),
                _ => {}
            }
        };
        assert_eq!(reset, (0, 0, 0, 0, false));

        handle.shutdown();
    }

    #[tokio::test]
    async fn throttle_updates_flow_without_a_link() {
        let settings = Settings::default();
        let (handle, mut updates) =
            spawn(|events| LoopbackTransport { events }, &settings).unwrap();

        handle.throttle_up();
        let update = next_update(&mut updates).await;
        match update {
            LinkUpdate::Control {
                throttle, bound, ..
            } => {
                assert_eq!(throttle, 5);
                assert!(!bound);
            }
            other => panic!("expected a control update, got {:?}", other),
        }

        handle.shutdown();
    }
}
