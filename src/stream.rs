// Frame delivery: pull loop over a frame source, push callback for transports

use crate::emotion::{FrameProcessor, FrameStats, ProcessedFrame, StatsSnapshot};
use crate::error::{EmotionStreamError, FrameError, Result};
use crate::models::{EmotionReading, Frame};
use crate::session::SessionState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Anything that turns a frame into an annotated frame plus an optional
/// reading. The stream drives it without knowing what is inside.
pub trait FrameHandler: Send {
    fn handle(&mut self, frame: Frame) -> ProcessedFrame;

    /// Like `handle`, for a frame the caller may give up on. Once `abandoned`
    /// is set the handler must not count or publish the frame's outcome.
    fn handle_abandonable(&mut self, frame: Frame, _abandoned: &AtomicBool) -> ProcessedFrame {
        self.handle(frame)
    }

    /// Counters the stream adds its own drops to.
    fn stats(&self) -> Arc<FrameStats>;
}

impl FrameHandler for FrameProcessor {
    fn handle(&mut self, frame: Frame) -> ProcessedFrame {
        self.process(frame)
    }

    fn handle_abandonable(&mut self, frame: Frame, abandoned: &AtomicBool) -> ProcessedFrame {
        self.process_abandonable(frame, abandoned)
    }

    fn stats(&self) -> Arc<FrameStats> {
        FrameProcessor::stats(self)
    }
}

/// Produces frames on demand.
pub trait FrameSource {
    /// `Ok(None)` means the source is exhausted; `Err` means it broke.
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        (**self).next_frame()
    }
}

/// Shows annotated frames and, when there is one, the reading.
pub trait DisplaySurface {
    fn render(&mut self, frame: &Frame, reading: Option<&EmotionReading>);

    /// Called once per session by [`StreamController::run_sessions`].
    fn session_ended(&mut self, _report: &SessionReport) {}
}

/// How often an idle controller re-reads the session flag.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Why a pull session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// The session flag was cleared.
    Stopped,
    /// The source ran out of frames.
    Exhausted,
    /// The source failed to deliver a frame.
    SourceUnavailable(EmotionStreamError),
}

impl SessionEnd {
    pub fn is_failure(&self) -> bool {
        matches!(self, SessionEnd::SourceUnavailable(_))
    }
}

/// Summary returned when a pull session ends.
#[derive(Debug)]
pub struct SessionReport {
    pub end: SessionEnd,
    /// Frames rendered during this session
    pub frames: u64,
    pub stats: StatsSnapshot,
}

/// Owns the acquisition loop for pull-mode sessions.
pub struct StreamController<H> {
    handler: H,
    session: SessionState,
    frame_interval: Option<Duration>,
}

impl<H: FrameHandler> StreamController<H> {
    pub fn new(handler: H, session: SessionState) -> Self {
        Self {
            handler,
            session,
            frame_interval: None,
        }
    }

    /// Sleeps between frames so the loop runs at most `fps` times a second.
    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.frame_interval = (fps > 0).then(|| Duration::from_secs_f64(1.0 / fps as f64));
        self
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn into_handler(self) -> H {
        self.handler
    }

    /// Reads, processes and renders frames until the session is stopped or
    /// the source runs dry or breaks.
    ///
    /// The session flag is checked before each frame and again after the
    /// pacing sleep, so a stop takes effect after at most the frame currently
    /// being rendered.
    pub fn run_pull<S, D>(&mut self, source: &mut S, display: &mut D) -> SessionReport
    where
        S: FrameSource + ?Sized,
        D: DisplaySurface + ?Sized,
    {
        let mut frames = 0u64;
        let mut last_frame_time: Option<Instant> = None;

        let end = loop {
            if !self.session.is_running() {
                break SessionEnd::Stopped;
            }

            // Rate limiting to the target frame interval
            if let (Some(interval), Some(last)) = (self.frame_interval, last_frame_time) {
                let elapsed = last.elapsed();
                if elapsed < interval {
                    std::thread::sleep(interval - elapsed);
                    if !self.session.is_running() {
                        break SessionEnd::Stopped;
                    }
                }
            }
            last_frame_time = Some(Instant::now());

            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break SessionEnd::Exhausted,
                Err(e) => {
                    error!("Failed to capture frame: {}", e);
                    break SessionEnd::SourceUnavailable(e);
                }
            };

            let processed = self.handler.handle(frame);
            display.render(&processed.frame, processed.reading());
            frames += 1;
        };

        let stats = self.handler.stats().snapshot();
        info!(
            "Pull session ended ({:?}) after {} frames, {} classified, {} failed",
            end, frames, stats.classified, stats.failed
        );
        SessionReport { end, frames, stats }
    }

    /// Serves sessions until `shutdown` is set: waits for the flag to be
    /// started, opens a fresh source, and runs the pull loop. A session that
    /// ends on its own (source exhausted or broken) clears the flag so the
    /// user has to start again.
    ///
    /// Set `shutdown` and stop the session to make this return.
    pub fn run_sessions<S, F, D>(&mut self, mut open_source: F, display: &mut D, shutdown: &AtomicBool)
    where
        S: FrameSource,
        F: FnMut() -> Result<S>,
        D: DisplaySurface + ?Sized,
    {
        while !shutdown.load(Ordering::SeqCst) {
            if !self.session.is_running() {
                std::thread::sleep(IDLE_POLL);
                continue;
            }

            let report = match open_source() {
                Ok(mut source) => self.run_pull(&mut source, display),
                Err(e) => {
                    error!("Could not open frame source: {}", e);
                    SessionReport {
                        end: SessionEnd::SourceUnavailable(e),
                        frames: 0,
                        stats: self.handler.stats().snapshot(),
                    }
                }
            };

            if !matches!(report.end, SessionEnd::Stopped) {
                self.session.stop();
            }
            display.session_ended(&report);
        }
    }
}

/// What the push callback hands back to the transport.
#[derive(Debug)]
pub enum Delivery {
    Processed(ProcessedFrame),
    /// The session is stopped; the frame was not looked at.
    Stopped(Frame),
    /// The frame was not analyzed (busy, deadline, task failure).
    Dropped(Frame, FrameError),
}

impl Delivery {
    pub fn frame(&self) -> &Frame {
        match self {
            Delivery::Processed(processed) => &processed.frame,
            Delivery::Stopped(frame) | Delivery::Dropped(frame, _) => frame,
        }
    }

    pub fn into_frame(self) -> Frame {
        match self {
            Delivery::Processed(processed) => processed.frame,
            Delivery::Stopped(frame) | Delivery::Dropped(frame, _) => frame,
        }
    }

    pub fn reading(&self) -> Option<&EmotionReading> {
        match self {
            Delivery::Processed(processed) => processed.reading(),
            _ => None,
        }
    }

    pub fn was_processed(&self) -> bool {
        matches!(self, Delivery::Processed(_))
    }
}

/// Per-frame callback for transports that deliver frames on their own
/// threads or tasks.
///
/// At most one frame is analyzed at a time; a frame that arrives while
/// another is in flight is returned unanalyzed instead of queued.
pub struct PushSession<H> {
    handler: Arc<Mutex<H>>,
    session: SessionState,
    stats: Arc<FrameStats>,
    deadline: Option<Duration>,
}

impl<H> Clone for PushSession<H> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            session: self.session.clone(),
            stats: self.stats.clone(),
            deadline: self.deadline,
        }
    }
}

fn try_claim<H>(handler: &Mutex<H>) -> std::result::Result<MutexGuard<'_, H>, FrameError> {
    match handler.try_lock() {
        Ok(guard) => Ok(guard),
        // A panic in an earlier frame leaves the handler usable.
        Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => Err(FrameError::Busy),
    }
}

impl<H: FrameHandler + 'static> PushSession<H> {
    pub fn new(handler: H, session: SessionState) -> Self {
        let stats = handler.stats();
        Self {
            handler: Arc::new(Mutex::new(handler)),
            session,
            stats,
            deadline: None,
        }
    }

    /// Gives up on a frame that takes longer than `deadline` (async path).
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Synchronous callback: analyzes the frame on the caller's thread and
    /// returns it to the transport.
    pub fn on_frame(&self, frame: Frame) -> Delivery {
        if !self.session.is_running() {
            return Delivery::Stopped(frame);
        }

        match try_claim(&self.handler) {
            Ok(mut handler) => Delivery::Processed(handler.handle(frame)),
            Err(e) => self.drop_frame(frame, e),
        }
    }

    /// Async callback: analyzes the frame on the blocking pool, optionally
    /// bounded by the configured deadline.
    ///
    /// A frame that misses the deadline is counted once, as failed. Its
    /// reading is never published.
    pub async fn on_frame_async(&self, frame: Frame) -> Delivery {
        if !self.session.is_running() {
            return Delivery::Stopped(frame);
        }

        let original = frame.clone();
        let handler = self.handler.clone();
        let abandoned = Arc::new(AtomicBool::new(false));
        let task = {
            let abandoned = abandoned.clone();
            tokio::task::spawn_blocking(move || {
                let mut handler = try_claim(&handler)?;
                Ok::<_, FrameError>(handler.handle_abandonable(frame, &abandoned))
            })
        };

        let joined = match self.deadline {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    // The blocking task keeps running; it must not count this frame again.
                    abandoned.store(true, Ordering::SeqCst);
                    return self.drop_frame(original, FrameError::DeadlineExceeded(limit));
                }
            },
            None => task.await,
        };

        match joined {
            Ok(Ok(processed)) => Delivery::Processed(processed),
            Ok(Err(e)) => self.drop_frame(original, e),
            Err(e) => self.drop_frame(
                original,
                FrameError::Classification(format!("frame task failed: {e}")),
            ),
        }
    }

    fn drop_frame(&self, frame: Frame, error: FrameError) -> Delivery {
        if matches!(error, FrameError::DeadlineExceeded(_)) {
            warn!("{}", error);
        }
        self.stats.record_failure(&error);
        Delivery::Dropped(frame, error)
    }
}
