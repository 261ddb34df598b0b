//! Shared-mode WASAPI input stream.
//!
//! Format negotiation happens on the caller's thread when the stream is
//! opened. `start` spawns a dedicated capture thread registered with MMCSS,
//! which owns every COM object of the stream and hands each captured packet
//! to the [`InputCallback`] as little-endian Float32 bytes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use windows::core::w;
use windows::Win32::Foundation::HANDLE;
use windows::Win32::Media::Audio::*;
use windows::Win32::System::Com::CLSCTX_ALL;
use windows::Win32::System::Threading::{
    AvRevertMmThreadCharacteristics, AvSetMmThreadCharacteristicsW,
};

use audio_meter_core::{
    BackendStream, ChannelLayout, DeviceDescriptor, InputCallback, InputChunk, MeterError,
    StreamRequest,
};

use crate::com::ComApartment;
use crate::device_enumerator::{mix_format, minimum_period, DeviceEnumerator, REFTIMES_PER_SEC};
use crate::error::{ComContext, WasapiError};

const WAVE_FORMAT_IEEE_FLOAT: u16 = 3;

// 100 ms endpoint buffer in REFERENCE_TIME units.
const BUFFER_DURATION: i64 = 1_000_000;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What the capture thread needs to rebuild the stream on its own apartment.
#[derive(Debug, Clone)]
struct CaptureConfig {
    device_id: String,
    sample_rate: u32,
    channels: u16,
    poll_interval: Duration,
}

/// WASAPI capture stream on one endpoint.
pub struct WasapiInputStream {
    device_id: String,
    sample_rate: u32,
    layout: ChannelLayout,
    latency: f64,
    running: Arc<AtomicBool>,
    capture_thread: Option<thread::JoinHandle<()>>,
}

impl WasapiInputStream {
    /// Negotiate against the endpoint's mix format. Nothing runs until `start`.
    ///
    /// Shared mode always captures at the mix format's rate and channel
    /// count; a request for a different layout gets the mix format's one.
    pub(crate) fn open(
        enumerator: &DeviceEnumerator,
        device: &DeviceDescriptor,
        request: &StreamRequest,
    ) -> Result<Self, WasapiError> {
        let endpoint = enumerator.device(&device.id)?;
        let client = unsafe { endpoint.Activate::<IAudioClient>(CLSCTX_ALL, None) }
            .call("IMMDevice::Activate")?;
        let format = mix_format(&client)?;
        let minimum = minimum_period(&client)?;

        let layout = if request.layout.channel_count == format.channels {
            request.layout.clone()
        } else {
            log::debug!(
                "{} captures {} channels, not the requested {}",
                device.id,
                format.channels,
                request.layout.channel_count
            );
            ChannelLayout::from_channel_count(format.channels)
        };

        Ok(Self {
            device_id: device.id.clone(),
            sample_rate: format.sample_rate,
            layout,
            latency: request.software_latency.max(minimum),
            running: Arc::new(AtomicBool::new(false)),
            capture_thread: None,
        })
    }

    fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            device_id: self.device_id.clone(),
            sample_rate: self.sample_rate,
            channels: self.layout.channel_count,
            poll_interval: Duration::from_secs_f64(self.latency / 2.0)
                .clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL),
        }
    }
}

impl BackendStream for WasapiInputStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    fn software_latency(&self) -> f64 {
        self.latency
    }

    fn start(&mut self, callback: Arc<dyn InputCallback>) -> Result<(), MeterError> {
        if self.capture_thread.is_some() {
            return Err(MeterError::InvalidState("capture already running".into()));
        }

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let config = self.capture_config();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let handle = thread::Builder::new()
            .name("wasapi-input-capture".into())
            .spawn(move || {
                let capture = match Capture::start(&config) {
                    Ok(capture) => {
                        let _ = ready_tx.send(Ok(()));
                        capture
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = capture.run(&running, callback.as_ref(), config.poll_interval) {
                    callback.on_error(&e.into_runtime(), true);
                }
                running.store(false, Ordering::SeqCst);
            })
            .map_err(|e| WasapiError::Thread(e.to_string()))?;

        let started = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(WasapiError::Thread("exited before starting".into())));

        match started {
            Ok(()) => {
                self.capture_thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(e.into())
            }
        }
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.capture_thread.take() {
            if handle.join().is_err() {
                log::error!("Capture thread for {} panicked", self.device_id);
            }
        }
    }
}

impl Drop for WasapiInputStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// COM side of a running stream. Lives on the capture thread only.
struct Capture {
    client: IAudioClient,
    capture_client: IAudioCaptureClient,
    block_align: usize,
    mmcss: Option<HANDLE>,
    // Dropped last.
    _apartment: ComApartment,
}

impl Capture {
    /// Sequence:
    /// 1. Join the MTA
    /// 2. Look the endpoint up by id
    /// 3. Activate and initialize `IAudioClient` for Float32 in shared mode
    /// 4. Get the `IAudioCaptureClient` service
    /// 5. Register with MMCSS for real-time priority
    /// 6. Start
    fn start(config: &CaptureConfig) -> Result<Self, WasapiError> {
        let apartment = ComApartment::enter()?;
        let enumerator = DeviceEnumerator::new()?;
        let device = enumerator.device(&config.device_id)?;

        let client = unsafe { device.Activate::<IAudioClient>(CLSCTX_ALL, None) }
            .call("IMMDevice::Activate")?;

        let format = float_format(config.sample_rate, config.channels);
        unsafe {
            client.Initialize(
                AUDCLNT_SHAREMODE_SHARED,
                AUDCLNT_STREAMFLAGS_NOPERSIST
                    | AUDCLNT_STREAMFLAGS_AUTOCONVERTPCM
                    | AUDCLNT_STREAMFLAGS_SRC_DEFAULT_QUALITY,
                BUFFER_DURATION,
                0,
                &format,
                None,
            )
        }
        .call("IAudioClient::Initialize")?;

        let capture_client = unsafe { client.GetService::<IAudioCaptureClient>() }
            .call("IAudioClient::GetService")?;

        let capture = Self {
            client,
            capture_client,
            block_align: usize::from(format.nBlockAlign),
            mmcss: register_mmcss(),
            _apartment: apartment,
        };
        unsafe { capture.client.Start() }.call("IAudioClient::Start")?;

        log::debug!(
            "WASAPI capture started on {} ({} ch @ {} Hz)",
            config.device_id,
            config.channels,
            config.sample_rate
        );
        Ok(capture)
    }

    /// Poll for packets until `running` drops.
    fn run(
        &self,
        running: &AtomicBool,
        callback: &dyn InputCallback,
        poll_interval: Duration,
    ) -> Result<(), WasapiError> {
        let silent = AUDCLNT_BUFFERFLAGS_SILENT.0 as u32;
        let discontinuity = AUDCLNT_BUFFERFLAGS_DATA_DISCONTINUITY.0 as u32;
        let mut first_packet = true;

        while running.load(Ordering::SeqCst) {
            thread::sleep(poll_interval);

            loop {
                let packet_length = unsafe { self.capture_client.GetNextPacketSize() }
                    .call("IAudioCaptureClient::GetNextPacketSize")?;
                if packet_length == 0 {
                    break;
                }

                let mut buffer_ptr: *mut u8 = std::ptr::null_mut();
                let mut num_frames: u32 = 0;
                let mut flags: u32 = 0;
                unsafe {
                    self.capture_client
                        .GetBuffer(&mut buffer_ptr, &mut num_frames, &mut flags, None, None)
                }
                .call("IAudioCaptureClient::GetBuffer")?;

                let len = num_frames as usize * self.block_align;
                if flags & silent != 0 {
                    callback.on_read(InputChunk::Gap(len));
                } else if len > 0 && !buffer_ptr.is_null() {
                    // Valid until ReleaseBuffer.
                    let bytes = unsafe { std::slice::from_raw_parts(buffer_ptr, len) };
                    callback.on_read(InputChunk::Samples(bytes));
                }

                // The first packet after Start always carries the flag.
                if flags & discontinuity != 0 && !first_packet {
                    callback.on_overflow();
                }
                first_packet = false;

                unsafe { self.capture_client.ReleaseBuffer(num_frames) }
                    .call("IAudioCaptureClient::ReleaseBuffer")?;
            }
        }
        Ok(())
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        unsafe {
            let _ = self.client.Stop();
            if let Some(handle) = self.mmcss.take() {
                let _ = AvRevertMmThreadCharacteristics(handle);
            }
        }
    }
}

fn register_mmcss() -> Option<HANDLE> {
    let mut task_index: u32 = 0;
    match unsafe { AvSetMmThreadCharacteristicsW(w!("Pro Audio"), &mut task_index) } {
        Ok(handle) => Some(handle),
        Err(e) => {
            log::debug!("MMCSS registration failed, capturing at normal priority: {}", e);
            None
        }
    }
}

fn float_format(sample_rate: u32, channels: u16) -> WAVEFORMATEX {
    let block_align = channels * 4;
    WAVEFORMATEX {
        wFormatTag: WAVE_FORMAT_IEEE_FLOAT,
        nChannels: channels,
        nSamplesPerSec: sample_rate,
        nAvgBytesPerSec: sample_rate * u32::from(block_align),
        nBlockAlign: block_align,
        wBitsPerSample: 32,
        cbSize: 0,
    }
}
