/// Background monitor module
///
/// Owns the capture loop: a dedicated thread pulls frames from the audio
/// source through the VAD and hands completed segments to a bounded pool of
/// recognition workers on the tokio runtime. Capture never waits on dispatch.

use crate::audio_source::{AudioError, AudioSource};
use crate::device::{DeviceLease, DeviceOwnership};
use crate::keep_alive::KeepAlive;
use crate::notify::{MonitoringNotice, Notifier, TracingNotifier};
use crate::recognition::SegmentProcessor;
use crate::segment::Segment;
use crate::vad::{VadConfig, VoiceActivityDetector};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Device-ownership name used by the monitor
pub const MONITOR_OWNER: &str = "monitor";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MonitorError {
    #[error("Monitor already running")]
    AlreadyRunning,

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error("Capture thread failed: {0}")]
    CaptureThread(String),
}

/// Recognition worker pool sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Concurrent recognizer calls
    pub max_in_flight: usize,

    /// Segments waiting for a worker before new ones are dropped
    pub queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 3,
            queue_capacity: 4,
        }
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_in_flight == 0 {
            return Err("max_in_flight must be greater than 0".to_string());
        }

        if self.queue_capacity == 0 {
            return Err("queue_capacity must be greater than 0".to_string());
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorLifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Lifecycle state plus the terminal fault, if the monitor stopped on its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorStatus {
    pub state: MonitorLifecycleState,
    pub fault: Option<String>,
}

impl MonitorStatus {
    fn new(state: MonitorLifecycleState) -> Self {
        Self { state, fault: None }
    }
}

#[derive(Default)]
struct MonitorCounters {
    frames_processed: AtomicU64,
    segments_emitted: AtomicU64,
    segments_dispatched: AtomicU64,
    segments_completed: AtomicU64,
    segments_failed: AtomicU64,
    segments_dropped: AtomicU64,
    segments_cancelled: AtomicU64,
    device_reinits: AtomicU64,
}

impl MonitorCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Monitor statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorStats {
    pub state: MonitorLifecycleState,
    pub frames_processed: u64,
    pub segments_emitted: u64,
    pub segments_dispatched: u64,
    pub segments_completed: u64,
    pub segments_failed: u64,
    /// Dropped because the recognition queue was full
    pub segments_dropped: u64,
    /// Queued or in flight when the monitor was stopped
    pub segments_cancelled: u64,
    pub device_reinits: u64,
}

struct DispatchHandle {
    queue_cancel: CancellationToken,
    force_cancel: CancellationToken,
    /// Cancelled when the dispatcher task exits
    done: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

struct RunHandle {
    capture_cancel: CancellationToken,
    capture_thread: JoinHandle<Box<dyn AudioSource>>,
    dispatch: DispatchHandle,
}

struct ServiceInner {
    source: Option<Box<dyn AudioSource>>,
    run: Option<RunHandle>,
    /// Dispatchers of stopped runs still finishing their recognitions
    draining: Vec<DispatchHandle>,
}

/// Long-running distress monitor
pub struct MonitorService {
    vad_config: VadConfig,
    dispatch_config: DispatchConfig,
    processor: Arc<dyn SegmentProcessor>,
    notifier: Arc<dyn Notifier>,
    keep_alive: KeepAlive,
    device: DeviceOwnership,
    status_tx: Arc<watch::Sender<MonitorStatus>>,
    counters: Arc<MonitorCounters>,
    inner: Mutex<ServiceInner>,
}

impl MonitorService {
    /// Create a stopped monitor over `source`
    pub fn new(
        vad_config: VadConfig,
        dispatch_config: DispatchConfig,
        source: Box<dyn AudioSource>,
        processor: Arc<dyn SegmentProcessor>,
        device: DeviceOwnership,
    ) -> Self {
        let (status_tx, _) = watch::channel(MonitorStatus::new(MonitorLifecycleState::Stopped));

        Self {
            vad_config,
            dispatch_config,
            processor,
            notifier: Arc::new(TracingNotifier),
            keep_alive: KeepAlive::default(),
            device,
            status_tx: Arc::new(status_tx),
            counters: Arc::new(MonitorCounters::default()),
            inner: Mutex::new(ServiceInner {
                source: Some(source),
                run: None,
                draining: Vec::new(),
            }),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: KeepAlive) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Start monitoring.
    ///
    /// Opens the audio source, takes the keep-alive resource and spawns the
    /// capture thread. Fails without side effects when already running, when
    /// the device is leased elsewhere, or when the device cannot be opened.
    pub async fn start(&self) -> Result<(), MonitorError> {
        let mut inner = self.inner.lock().await;

        if self.state() != MonitorLifecycleState::Stopped {
            warn!("Monitor already running");
            return Err(MonitorError::AlreadyRunning);
        }

        // A run that stopped on a device fault still has to be reaped
        if let Some(run) = inner.run.take() {
            if let Err(e) = self.reap(&mut inner, run).await {
                warn!("Previous capture run ended badly: {}", e);
            }
        }

        self.status_tx.send_replace(MonitorStatus::new(MonitorLifecycleState::Starting));

        match self.launch(&mut inner) {
            Ok(run) => {
                inner.run = Some(run);
                info!("Monitor started");
                Ok(())
            }
            Err(e) => {
                error!("Failed to start monitor: {}", e);
                self.status_tx.send_replace(MonitorStatus {
                    state: MonitorLifecycleState::Stopped,
                    fault: Some(e.to_string()),
                });
                Err(e)
            }
        }
    }

    fn launch(&self, inner: &mut ServiceInner) -> Result<RunHandle, MonitorError> {
        let lease = self.device.try_acquire(MONITOR_OWNER)?;

        let mut source = inner.source.take().ok_or_else(|| {
            AudioError::DeviceUnavailable("audio source lost by a previous run".to_string())
        })?;

        if let Err(e) = source.open() {
            inner.source = Some(source);
            return Err(e.into());
        }

        self.keep_alive.acquire();
        if let Err(e) = self.notifier.show_monitoring(&MonitoringNotice::default()) {
            warn!("Failed to show monitoring notice: {}", e);
        }
        self.status_tx.send_replace(MonitorStatus::new(MonitorLifecycleState::Running));

        let (segment_tx, segment_rx) = mpsc::channel(self.dispatch_config.queue_capacity);
        let dispatch = self.spawn_dispatcher(segment_rx);

        let capture_cancel = CancellationToken::new();
        let capture = CaptureLoop {
            vad: VoiceActivityDetector::with_config(self.vad_config.clone()),
            segment_tx,
            cancel: capture_cancel.clone(),
            counters: Arc::clone(&self.counters),
            status_tx: Arc::clone(&self.status_tx),
            keep_alive: self.keep_alive.clone(),
            notifier: Arc::clone(&self.notifier),
            lease: Some(lease),
        };

        let spawned = std::thread::Builder::new()
            .name("monitor-capture".to_string())
            .spawn(move || capture.run(source));

        match spawned {
            Ok(capture_thread) => Ok(RunHandle {
                capture_cancel,
                capture_thread,
                dispatch,
            }),
            Err(e) => {
                dispatch.force_cancel.cancel();
                self.keep_alive.release();
                let _ = self.notifier.clear_monitoring();
                Err(MonitorError::CaptureThread(e.to_string()))
            }
        }
    }

    fn spawn_dispatcher(&self, segment_rx: mpsc::Receiver<Segment>) -> DispatchHandle {
        let queue_cancel = CancellationToken::new();
        let force_cancel = CancellationToken::new();
        let permits = Arc::new(Semaphore::new(self.dispatch_config.max_in_flight));

        let done = CancellationToken::new();
        let exit_guard = done.clone().drop_guard();

        let dispatcher = run_dispatcher(
            segment_rx,
            Arc::clone(&self.processor),
            permits,
            queue_cancel.clone(),
            force_cancel.clone(),
            Arc::clone(&self.counters),
        );
        let task = tokio::spawn(async move {
            let _exit_guard = exit_guard;
            dispatcher.await;
        });

        DispatchHandle {
            queue_cancel,
            force_cancel,
            done,
            task,
        }
    }

    /// Stop monitoring. Idempotent.
    ///
    /// Returns once the capture thread has exited and the device is closed.
    /// Queued segments are dropped; recognitions already running finish.
    pub async fn stop(&self) -> Result<(), MonitorError> {
        let mut inner = self.inner.lock().await;

        let run = match inner.run.take() {
            Some(run) => run,
            None => {
                debug!("Monitor not running");
                return Ok(());
            }
        };

        self.status_tx.send_modify(|status| {
            if status.state == MonitorLifecycleState::Running {
                status.state = MonitorLifecycleState::Stopping;
            }
        });

        let result = self.reap(&mut inner, run).await;

        // A fault reported by the capture loop stays visible
        self.status_tx.send_modify(|status| {
            if status.state != MonitorLifecycleState::Stopped {
                *status = MonitorStatus::new(MonitorLifecycleState::Stopped);
            }
        });

        info!("Monitor stopped");
        result
    }

    /// Stop monitoring and cancel every outstanding recognition
    pub async fn shutdown(&self) -> Result<(), MonitorError> {
        let result = self.stop().await;

        let draining: Vec<DispatchHandle> = self.inner.lock().await.draining.drain(..).collect();
        for dispatch in draining {
            dispatch.force_cancel.cancel();
            if let Err(e) = dispatch.task.await {
                warn!("Dispatcher task failed: {}", e);
            }
        }

        info!("Monitor shut down");
        result
    }

    /// Wait for recognitions left running by earlier stops.
    ///
    /// Dropping the returned future leaves them running; `shutdown()` can
    /// still cancel them.
    pub async fn wait_for_dispatches(&self) {
        let pending: Vec<CancellationToken> = {
            let mut inner = self.inner.lock().await;
            inner.draining.retain(|d| !d.task.is_finished());
            inner.draining.iter().map(|d| d.done.clone()).collect()
        };

        for done in pending {
            done.cancelled().await;
        }
    }

    /// Cancel capture, join the capture thread and recover the source
    async fn reap(&self, inner: &mut ServiceInner, run: RunHandle) -> Result<(), MonitorError> {
        run.capture_cancel.cancel();

        let thread = run.capture_thread;
        let joined = tokio::task::spawn_blocking(move || thread.join()).await;

        let result = match joined {
            Ok(Ok(source)) => {
                inner.source = Some(source);
                Ok(())
            }
            Ok(Err(_)) => Err(MonitorError::CaptureThread("capture thread panicked".to_string())),
            Err(e) => Err(MonitorError::CaptureThread(e.to_string())),
        };

        run.dispatch.queue_cancel.cancel();
        inner.draining.retain(|d| !d.task.is_finished());
        inner.draining.push(run.dispatch);

        if self.keep_alive.is_held() {
            self.keep_alive.release();
            if let Err(e) = self.notifier.clear_monitoring() {
                warn!("Failed to clear monitoring notice: {}", e);
            }
        }

        result
    }

    pub fn state(&self) -> MonitorLifecycleState {
        self.status_tx.borrow().state
    }

    pub fn status(&self) -> MonitorStatus {
        self.status_tx.borrow().clone()
    }

    /// Watch lifecycle changes, including faults raised by the capture loop
    pub fn subscribe(&self) -> watch::Receiver<MonitorStatus> {
        self.status_tx.subscribe()
    }

    /// Get current statistics
    pub fn stats(&self) -> MonitorStats {
        let c = &self.counters;
        MonitorStats {
            state: self.state(),
            frames_processed: c.frames_processed.load(Ordering::Relaxed),
            segments_emitted: c.segments_emitted.load(Ordering::Relaxed),
            segments_dispatched: c.segments_dispatched.load(Ordering::Relaxed),
            segments_completed: c.segments_completed.load(Ordering::Relaxed),
            segments_failed: c.segments_failed.load(Ordering::Relaxed),
            segments_dropped: c.segments_dropped.load(Ordering::Relaxed),
            segments_cancelled: c.segments_cancelled.load(Ordering::Relaxed),
            device_reinits: c.device_reinits.load(Ordering::Relaxed),
        }
    }
}

impl Drop for MonitorService {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(run) = inner.run.take() {
            run.capture_cancel.cancel();
            run.dispatch.force_cancel.cancel();
        }
        for dispatch in inner.draining.drain(..) {
            dispatch.force_cancel.cancel();
        }
        if self.keep_alive.is_held() {
            self.keep_alive.release();
            if let Err(e) = self.notifier.clear_monitoring() {
                warn!("Failed to clear monitoring notice: {}", e);
            }
        }
    }
}

/// State moved onto the capture thread
struct CaptureLoop {
    vad: VoiceActivityDetector,
    segment_tx: mpsc::Sender<Segment>,
    cancel: CancellationToken,
    counters: Arc<MonitorCounters>,
    status_tx: Arc<watch::Sender<MonitorStatus>>,
    keep_alive: KeepAlive,
    notifier: Arc<dyn Notifier>,
    lease: Option<DeviceLease>,
}

impl CaptureLoop {
    fn run(mut self, mut source: Box<dyn AudioSource>) -> Box<dyn AudioSource> {
        info!("Capture loop started");

        // One reinit per run; a later failure is fatal even after good frames
        let mut reinitialized = false;

        let fault = loop {
            if self.cancel.is_cancelled() {
                break None;
            }

            match source.read_frame() {
                Ok(frame) => {
                    MonitorCounters::bump(&self.counters.frames_processed);

                    if let Some(segment) = self.vad.observe(frame) {
                        self.dispatch(segment);
                    }
                }
                Err(e) => {
                    if self.cancel.is_cancelled() {
                        break None;
                    }

                    warn!("Audio read failed: {}", e);
                    if let Some(segment) = self.vad.flush() {
                        self.dispatch(segment);
                    }

                    if reinitialized {
                        break Some(format!("audio device failed after reinitialization: {}", e));
                    }

                    source.close();
                    MonitorCounters::bump(&self.counters.device_reinits);
                    match source.open() {
                        Ok(()) => {
                            info!("Audio device reinitialized");
                            reinitialized = true;
                        }
                        Err(e) => {
                            break Some(format!("audio device reinitialization failed: {}", e));
                        }
                    }
                }
            }
        };

        source.close();
        drop(self.lease.take());

        if let Some(fault) = fault {
            error!("Monitor stopped on device fault: {}", fault);
            self.keep_alive.release();
            if let Err(e) = self.notifier.clear_monitoring() {
                warn!("Failed to clear monitoring notice: {}", e);
            }
            self.status_tx.send_modify(|status| {
                if status.state == MonitorLifecycleState::Running {
                    *status = MonitorStatus {
                        state: MonitorLifecycleState::Stopped,
                        fault: Some(fault),
                    };
                }
            });
        }

        info!(
            "Capture loop exited after {} frames",
            self.counters.frames_processed.load(Ordering::Relaxed)
        );
        source
    }

    /// Hand a segment to the recognition queue without blocking
    fn dispatch(&self, segment: Segment) {
        MonitorCounters::bump(&self.counters.segments_emitted);
        let seconds = segment.duration().as_secs_f32();

        match self.segment_tx.try_send(segment) {
            Ok(()) => debug!("Queued {:.1}s segment for recognition", seconds),
            Err(TrySendError::Full(_)) => {
                MonitorCounters::bump(&self.counters.segments_dropped);
                warn!("Recognition queue full, dropping {:.1}s segment", seconds);
            }
            Err(TrySendError::Closed(_)) => {
                MonitorCounters::bump(&self.counters.segments_dropped);
                warn!("Recognition dispatcher gone, dropping {:.1}s segment", seconds);
            }
        }
    }
}

async fn next_job(
    segment_rx: &mut mpsc::Receiver<Segment>,
    permits: &Arc<Semaphore>,
) -> Option<(OwnedSemaphorePermit, Segment)> {
    let permit = Arc::clone(permits).acquire_owned().await.ok()?;
    let segment = segment_rx.recv().await?;
    Some((permit, segment))
}

async fn run_dispatcher(
    mut segment_rx: mpsc::Receiver<Segment>,
    processor: Arc<dyn SegmentProcessor>,
    permits: Arc<Semaphore>,
    queue_cancel: CancellationToken,
    force_cancel: CancellationToken,
    counters: Arc<MonitorCounters>,
) {
    let mut workers = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = force_cancel.cancelled() => break,
            _ = queue_cancel.cancelled() => break,
            Some(joined) = workers.join_next(), if !workers.is_empty() => {
                record_join(&counters, joined);
            }
            job = next_job(&mut segment_rx, &permits) => match job {
                Some((permit, segment)) => {
                    MonitorCounters::bump(&counters.segments_dispatched);
                    let processor = Arc::clone(&processor);
                    let counters = Arc::clone(&counters);
                    workers.spawn(async move {
                        let _permit = permit;
                        match processor.process(segment).await {
                            Ok(result) => {
                                MonitorCounters::bump(&counters.segments_completed);
                                debug!("Segment recognized (keyword: {})", result.keyword_detected);
                            }
                            Err(e) => {
                                MonitorCounters::bump(&counters.segments_failed);
                                debug!("Segment dropped: {}", e);
                            }
                        }
                    });
                }
                None => break,
            },
        }
    }

    // Segments still queued here were never handed to a worker
    segment_rx.close();
    while segment_rx.try_recv().is_ok() {
        MonitorCounters::bump(&counters.segments_cancelled);
    }

    loop {
        tokio::select! {
            biased;

            _ = force_cancel.cancelled(), if !workers.is_empty() => {
                warn!("Cancelling {} in-flight recognitions", workers.len());
                workers.abort_all();
                while let Some(joined) = workers.join_next().await {
                    record_join(&counters, joined);
                }
                break;
            }
            joined = workers.join_next() => match joined {
                Some(joined) => record_join(&counters, joined),
                None => break,
            },
        }
    }

    debug!("Dispatcher exited");
}

fn record_join(counters: &MonitorCounters, joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_cancelled() {
            MonitorCounters::bump(&counters.segments_cancelled);
        } else {
            MonitorCounters::bump(&counters.segments_failed);
            error!("Recognition worker panicked: {}", e);
        }
    }
}
