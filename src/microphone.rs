/// Microphone capture module
///
/// `AudioSource` over the default cpal input device. The cpal callback
/// downmixes and resamples to 16kHz mono i16 and pushes into a lock-free ring
/// buffer; `read_frame` drains it on the capture thread.

use crate::audio_source::{
    samples_to_duration, AudioError, AudioFrame, AudioSample, AudioSource, CaptureConfig,
    SAMPLE_RATE,
};
use cache_padded::CachePadded;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::HeapRb;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

type RingBuffer = HeapRb<AudioSample>;
type RingProducer = <RingBuffer as Split>::Prod;
type RingConsumer = <RingBuffer as Split>::Cons;

/// Ring buffer size: 3 seconds at 16kHz sample rate
const RING_DURATION_SECS: usize = 3;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct StreamShared {
    failed: AtomicBool,
    overrun_samples: CachePadded<AtomicU64>,
}

struct StreamWorker {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Default system microphone
pub struct MicrophoneSource {
    frame_samples: usize,
    read_timeout: Duration,
    consumer: Option<RingConsumer>,
    worker: Option<StreamWorker>,
    shared: Arc<StreamShared>,
    samples_read: u64,
}

impl MicrophoneSource {
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            frame_samples: config.frame_samples(),
            read_timeout: config.read_timeout(),
            consumer: None,
            worker: None,
            shared: Arc::new(StreamShared::default()),
            samples_read: 0,
        }
    }

    /// Samples dropped because the capture thread fell behind
    pub fn overrun_samples(&self) -> u64 {
        self.shared.overrun_samples.load(Ordering::Relaxed)
    }
}

impl AudioSource for MicrophoneSource {
    fn open(&mut self) -> Result<(), AudioError> {
        if self.worker.is_some() {
            debug!("Microphone already open");
            return Ok(());
        }

        let capacity = (SAMPLE_RATE as usize * RING_DURATION_SECS).max(self.frame_samples * 2);
        let (producer, consumer) = RingBuffer::new(capacity).split();
        let shared = Arc::new(StreamShared::default());

        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), AudioError>>();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stream_shared = Arc::clone(&shared);

        // cpal streams are not Send on every host, so the stream lives on its own thread
        let handle = std::thread::Builder::new()
            .name("mic-stream".to_string())
            .spawn(move || {
                let stream = match open_input_stream(producer, stream_shared) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(device_error(e)));
                    return;
                }

                let _ = ready_tx.send(Ok(()));
                let _ = shutdown_rx.recv();
                drop(stream);
                debug!("Microphone stream thread exiting");
            })
            .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = shutdown_tx.send(());
                return Err(AudioError::DeviceUnavailable(
                    "timed out opening input stream".to_string(),
                ));
            }
        }

        self.consumer = Some(consumer);
        self.shared = shared;
        self.worker = Some(StreamWorker { shutdown_tx, handle });
        self.samples_read = 0;

        info!("Microphone opened ({} samples per frame)", self.frame_samples);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<AudioFrame, AudioError> {
        let consumer = self.consumer.as_mut().ok_or(AudioError::NotOpen)?;

        let mut samples = vec![0; self.frame_samples];
        let mut filled = 0;
        let deadline = Instant::now() + self.read_timeout;

        while filled < samples.len() {
            if self.shared.failed.load(Ordering::Acquire) {
                return Err(AudioError::DeviceUnavailable(
                    "input stream reported an error".to_string(),
                ));
            }

            filled += consumer.pop_slice(&mut samples[filled..]);

            if filled < samples.len() {
                if Instant::now() >= deadline {
                    return Err(AudioError::ReadTimeout(self.read_timeout));
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }

        let timestamp = samples_to_duration(self.samples_read as usize);
        self.samples_read += samples.len() as u64;

        Ok(AudioFrame::new(samples, timestamp))
    }

    fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.shutdown_tx.send(());
            if worker.handle.join().is_err() {
                warn!("Microphone stream thread panicked");
            }

            let overruns = self.overrun_samples();
            if overruns > 0 {
                warn!("Microphone closed with {} overrun samples", overruns);
            }
            info!("Microphone closed");
        }
        self.consumer = None;
    }

    fn is_open(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for MicrophoneSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Map a cpal error, picking out OS permission refusals
fn device_error(e: impl Display) -> AudioError {
    let message = e.to_string();
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
        AudioError::PermissionDenied(message)
    } else {
        AudioError::DeviceUnavailable(message)
    }
}

fn format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::I16 => 0,
        cpal::SampleFormat::F32 => 1,
        _ => 2,
    }
}

/// Prefer a config that can run at 16kHz natively, fewest channels first
fn choose_config(device: &cpal::Device) -> Result<cpal::SupportedStreamConfig, AudioError> {
    let native = device
        .supported_input_configs()
        .map_err(device_error)?
        .filter(|range| {
            range.min_sample_rate().0 <= SAMPLE_RATE && range.max_sample_rate().0 >= SAMPLE_RATE
        })
        .min_by_key(|range| (range.channels(), format_rank(range.sample_format())));

    match native {
        Some(range) => Ok(range.with_sample_rate(cpal::SampleRate(SAMPLE_RATE))),
        None => device.default_input_config().map_err(device_error),
    }
}

fn open_input_stream(
    producer: RingProducer,
    shared: Arc<StreamShared>,
) -> Result<cpal::Stream, AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| AudioError::DeviceUnavailable("no default input device".to_string()))?;

    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    let supported = choose_config(&device)?;
    let channels = supported.channels() as usize;
    let device_rate = supported.sample_rate().0;

    info!(
        "Using input device '{}': {} Hz, {} channel(s), {:?}",
        name,
        device_rate,
        channels,
        supported.sample_format()
    );

    let converter = StreamConverter::new(channels, device_rate);
    let config: cpal::StreamConfig = supported.config();

    match supported.sample_format() {
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, converter, producer, shared),
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, converter, producer, shared),
        cpal::SampleFormat::I32 => build_stream::<i32>(&device, &config, converter, producer, shared),
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, converter, producer, shared),
        format => Err(AudioError::DeviceUnavailable(format!(
            "unsupported sample format: {:?}",
            format
        ))),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut converter: StreamConverter,
    mut producer: RingProducer,
    shared: Arc<StreamShared>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + Send + 'static,
    i16: FromSample<T>,
{
    let error_shared = Arc::clone(&shared);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let converted = converter.push(data, |s| i16::from_sample(s));
                let written = producer.push_slice(converted);
                if written < converted.len() {
                    shared
                        .overrun_samples
                        .fetch_add((converted.len() - written) as u64, Ordering::Relaxed);
                }
            },
            move |err| {
                error!("Audio stream error: {}", err);
                error_shared.failed.store(true, Ordering::Release);
            },
            None,
        )
        .map_err(device_error)
}

/// Downmix interleaved input to mono and linearly resample to 16kHz
struct StreamConverter {
    channels: usize,
    step: f64,
    position: f64,
    previous: f32,
    mono: Vec<f32>,
    output: Vec<AudioSample>,
}

impl StreamConverter {
    fn new(channels: usize, device_rate: u32) -> Self {
        Self {
            channels: channels.max(1),
            step: device_rate.max(1) as f64 / SAMPLE_RATE as f64,
            position: 0.0,
            previous: 0.0,
            mono: Vec::new(),
            output: Vec::new(),
        }
    }

    fn push<T: Copy>(&mut self, data: &[T], convert: impl Fn(T) -> i16) -> &[AudioSample] {
        self.mono.clear();
        self.output.clear();

        for frame in data.chunks(self.channels) {
            let sum: f32 = frame.iter().map(|&s| convert(s) as f32).sum();
            self.mono.push(sum / frame.len() as f32);
        }

        if self.mono.is_empty() {
            return &self.output;
        }

        if (self.step - 1.0).abs() < f64::EPSILON {
            self.output.extend(self.mono.iter().map(|&s| s as AudioSample));
            return &self.output;
        }

        // Index 0 is the last sample of the previous callback, index i is mono[i - 1]
        let len = self.mono.len() as f64;
        while self.position < len {
            let index = self.position.floor() as usize;
            let frac = (self.position - index as f64) as f32;
            let a = if index == 0 { self.previous } else { self.mono[index - 1] };
            let b = self.mono[index];
            self.output.push((a + (b - a) * frac) as AudioSample);
            self.position += self.step;
        }
        self.position -= len;
        self.previous = self.mono[self.mono.len() - 1];

        &self.output
    }
}
