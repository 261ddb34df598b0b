use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::handle::DeviceHandle;
use crate::device::input_stream::InputStream;
use crate::models::config::MeterConfig;
use crate::models::device::{DeviceDescriptor, DeviceEnumeration};
use crate::models::error::MeterError;
use crate::traits::audio_backend::{AudioBackend, SharedBackend};

/// Device handle as owned by the registry and referenced by input streams.
pub type SharedHandle = Arc<Mutex<DeviceHandle>>;

/// Owns the backend and one [`DeviceHandle`] per usable input device.
///
/// Handles survive rescans for as long as their device keeps being
/// enumerated, so an open stream is never interrupted by a hot-plug event on
/// another device. The default device is always listed first.
///
/// ```text
/// host loop ── update(dt) ──> flush_events ──> DeviceHandle::update (each)
/// client ── list_devices / stream(id) ──> flush_events ──> rescan if hot-plugged
/// ```
pub struct DeviceRegistry {
    backend: SharedBackend,
    config: MeterConfig,
    handles: Vec<SharedHandle>,
    rescan_needed: Arc<AtomicBool>,
}

impl DeviceRegistry {
    /// Create a registry with the default [`MeterConfig`].
    pub fn new<B: AudioBackend + 'static>(backend: B) -> Self {
        Self::build(backend, MeterConfig::default())
    }

    pub fn with_config<B: AudioBackend + 'static>(
        backend: B,
        config: MeterConfig,
    ) -> Result<Self, MeterError> {
        config.validate().map_err(MeterError::ConfigurationFailed)?;
        Ok(Self::build(backend, config))
    }

    fn build<B: AudioBackend + 'static>(mut backend: B, config: MeterConfig) -> Self {
        // The first listing always scans.
        let rescan_needed = Arc::new(AtomicBool::new(true));

        let flag = Arc::clone(&rescan_needed);
        backend.set_devices_changed_callback(Arc::new(move || {
            flag.store(true, Ordering::SeqCst);
        }));
        backend.flush_events();

        Self {
            backend: Arc::new(Mutex::new(backend)),
            config,
            handles: Vec::new(),
            rescan_needed,
        }
    }

    pub fn config(&self) -> &MeterConfig {
        &self.config
    }

    /// Whether a hot-plug notification is waiting for the next listing.
    pub fn rescan_pending(&self) -> bool {
        self.rescan_needed.load(Ordering::SeqCst)
    }

    /// Usable input devices, default first.
    pub fn list_devices(&mut self) -> Vec<DeviceDescriptor> {
        self.refresh();
        self.handles
            .iter()
            .map(|h| h.lock().descriptor().clone())
            .collect()
    }

    /// Current handles, default first.
    pub fn handles(&mut self) -> &[SharedHandle] {
        self.refresh();
        &self.handles
    }

    pub fn find_device(&mut self, id: &str) -> Option<SharedHandle> {
        self.refresh();
        self.handles.iter().find(|h| h.lock().id() == id).cloned()
    }

    /// Stream on the default device (the first listed one).
    pub fn default_stream(&mut self) -> Option<InputStream> {
        self.refresh();
        self.handles.first().map(InputStream::new)
    }

    pub fn stream(&mut self, id: &str) -> Option<InputStream> {
        self.find_device(id).map(|h| InputStream::new(&h))
    }

    /// Per-frame tick: drain and meter every known device.
    ///
    /// Must run once per host frame before levels are read that frame.
    pub fn update(&mut self, delta_secs: f64) {
        self.backend.lock().flush_events();
        for handle in &self.handles {
            handle.lock().update(delta_secs);
        }
    }

    fn refresh(&mut self) {
        self.backend.lock().flush_events();
        if self.rescan_needed.swap(false, Ordering::SeqCst) {
            self.rescan();
        }
    }

    fn rescan(&mut self) {
        let enumeration = match self.backend.lock().enumerate_input_devices() {
            Ok(enumeration) => enumeration,
            Err(err) => {
                log::warn!("Input device enumeration failed, treating as no devices: {}", err);
                DeviceEnumeration::default()
            }
        };

        let mut previous = std::mem::take(&mut self.handles);
        let mut found: Vec<SharedHandle> = Vec::with_capacity(enumeration.devices.len());

        for (index, descriptor) in enumeration.devices.into_iter().enumerate() {
            if !descriptor.is_usable() {
                log::debug!("Skipping unusable input device {}", descriptor.id);
                continue;
            }

            let existing = previous
                .iter()
                .position(|h| h.lock().id() == descriptor.id);

            let handle = match existing {
                Some(pos) => previous.swap_remove(pos),
                None => {
                    log::debug!("New input device {} ({})", descriptor.id, descriptor.name);
                    Arc::new(Mutex::new(DeviceHandle::new(
                        descriptor,
                        Arc::clone(&self.backend),
                        self.config.clone(),
                    )))
                }
            };

            if enumeration.default_index == Some(index) {
                found.insert(0, handle);
            } else {
                found.push(handle);
            }
        }

        for gone in previous {
            let mut handle = gone.lock();
            log::debug!("Input device {} disappeared", handle.id());
            handle.retire();
        }

        self.handles = found;
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.lock().retire();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::handle::StreamState;
    use crate::mock::MockBackend;
    use crate::models::device::ChannelLayout;

    fn registry_with(ids: &[&str]) -> (DeviceRegistry, MockBackend) {
        let backend = MockBackend::new();
        for id in ids {
            backend.add_input(id, 2, 48000);
        }
        (DeviceRegistry::new(backend.clone()), backend)
    }

    fn ids(registry: &mut DeviceRegistry) -> Vec<String> {
        registry.list_devices().into_iter().map(|d| d.id).collect()
    }

    #[test]
    fn lists_devices_in_enumeration_order() {
        let (mut registry, _backend) = registry_with(&["a", "b", "c"]);
        assert_eq!(ids(&mut registry), vec!["a", "b", "c"]);
    }

    #[test]
    fn default_device_is_listed_first() {
        let (mut registry, backend) = registry_with(&["a", "b", "c"]);
        backend.set_default_index(Some(2));
        assert_eq!(ids(&mut registry), vec!["c", "a", "b"]);
    }

    #[test]
    fn filters_raw_and_layoutless_devices() {
        let (mut registry, backend) = registry_with(&["ok"]);
        backend.add_device(
            DeviceDescriptor {
                id: "raw".into(),
                name: "Raw".into(),
                is_raw: true,
                layouts: vec![ChannelLayout::stereo()],
                software_latency_min: 0.0,
            },
            48000,
        );
        backend.add_device(
            DeviceDescriptor {
                id: "empty".into(),
                name: "Empty".into(),
                is_raw: false,
                layouts: Vec::new(),
                software_latency_min: 0.0,
            },
            48000,
        );

        assert_eq!(ids(&mut registry), vec!["ok"]);
    }

    #[test]
    fn without_notification_the_cached_list_is_returned() {
        let (mut registry, backend) = registry_with(&["a"]);
        assert_eq!(ids(&mut registry), vec!["a"]);

        backend.set_enumeration_failure(true);
        assert_eq!(ids(&mut registry), vec!["a"]);
        assert!(!registry.rescan_pending());
    }

    #[test]
    fn enumeration_failure_means_no_devices() {
        let (mut registry, backend) = registry_with(&["a"]);
        assert_eq!(ids(&mut registry).len(), 1);

        backend.set_enumeration_failure(true);
        backend.notify_devices_changed();
        assert!(registry.list_devices().is_empty());
    }

    #[test]
    fn find_device_by_id() {
        let (mut registry, _backend) = registry_with(&["a", "b"]);
        let handle = registry.find_device("b").unwrap();
        assert_eq!(handle.lock().id(), "b");
        assert!(registry.find_device("zzz").is_none());
    }

    #[test]
    fn rescan_keeps_open_handle() {
        let (mut registry, backend) = registry_with(&["x"]);
        let before = registry.find_device("x").unwrap();
        before.lock().prepare();
        assert_eq!(before.lock().stream_state(), StreamState::Open);

        backend.add_input("y", 1, 44100);
        assert_eq!(ids(&mut registry), vec!["x", "y"]);

        let after = registry.find_device("x").unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.lock().stream_state(), StreamState::Open);
        assert_eq!(backend.open_count("x"), 1);
        assert_eq!(backend.close_count("x"), 0);
    }

    #[test]
    fn update_without_streams_is_harmless() {
        let (mut registry, _backend) = registry_with(&["a"]);
        registry.list_devices();
        registry.update(1.0 / 60.0);
        assert_eq!(
            registry.find_device("a").unwrap().lock().stream_state(),
            StreamState::Closed
        );
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = MeterConfig {
            idle_tick_limit: 0,
            ..MeterConfig::default()
        };
        let result = DeviceRegistry::with_config(MockBackend::new(), config);
        assert!(matches!(result, Err(MeterError::ConfigurationFailed(_))));
    }

    #[test]
    fn dropping_registry_closes_streams() {
        let (mut registry, backend) = registry_with(&["a"]);
        registry.find_device("a").unwrap().lock().prepare();
        assert!(backend.is_streaming("a"));

        drop(registry);
        assert!(!backend.is_streaming("a"));
        assert_eq!(backend.close_count("a"), 1);
    }
}
