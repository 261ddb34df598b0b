//! Live level meter for the default capture device.
//!
//! ```text
//! RUST_LOG=debug cargo run -p audio-meter-windows --example level_monitor
//! ```

#[cfg(target_os = "windows")]
fn main() {
    use std::thread;
    use std::time::{Duration, Instant};

    use audio_meter_core::{DeviceRegistry, FilterType, LevelTracker, TrackerConfig};
    use audio_meter_windows::{permissions, WasapiBackend};

    env_logger::init();

    match permissions::check_microphone_access() {
        Ok(true) => {}
        Ok(false) => {
            eprintln!("Microphone unavailable or disabled in privacy settings");
            return;
        }
        Err(e) => log::warn!("Microphone access check failed: {}", e),
    }

    let mut registry = DeviceRegistry::new(WasapiBackend::new());
    for device in registry.list_devices() {
        println!("{}  {}", device.id, device.name);
    }

    let Some(stream) = registry.default_stream() else {
        eprintln!("No capture device");
        return;
    };

    let mut tracker = match LevelTracker::new(TrackerConfig::default()) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };

    let frame = Duration::from_secs_f64(1.0 / 60.0);
    let mut last = Instant::now();
    for _ in 0..600 {
        thread::sleep(frame);
        let now = Instant::now();
        let delta = now.duration_since(last).as_secs_f64();
        last = now;

        registry.update(delta);
        let normalized = tracker.update(&mut registry, delta as f32);
        let levels = stream.channel_levels(0).unwrap_or_default();

        let bar = "#".repeat((normalized * 40.0) as usize);
        println!(
            "{:<40} rms {:.3}  low {:.3}  band {:.3}  high {:.3}",
            bar,
            levels.get(FilterType::Bypass),
            levels.get(FilterType::LowPass),
            levels.get(FilterType::BandPass),
            levels.get(FilterType::HighPass),
        );
    }
}

#[cfg(not(target_os = "windows"))]
fn main() {
    eprintln!("level_monitor requires Windows");
}
