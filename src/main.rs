use emotion_stream::config::{AppConfig, DeliveryMode};
use emotion_stream::emotion::{FrameProcessor, SharedModels};
use emotion_stream::error::{EmotionStreamError, Result};
use emotion_stream::labels::LabelMap;
use emotion_stream::onnx::{OnnxClassifier, OnnxFaceMesh};
use emotion_stream::overlay::{Annotator, OverlayStyle};
use emotion_stream::session::SessionState;
use emotion_stream::source::{ImageDirSource, SnapshotWriter};
use emotion_stream::stream::{
    DisplaySurface, FrameSource, PushSession, SessionEnd, StreamController,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the logging system (file only, no console output)
fn init_logging(path: &Path) -> Result<()> {
    let log_file = std::fs::File::create(path)?;

    let file_layer = fmt::layer()
        .with_writer(Arc::new(log_file))
        .with_ansi(false);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .init();

    Ok(())
}

fn build_annotator(config: &AppConfig) -> Result<Annotator> {
    let font = match &config.caption_font {
        Some(path) => Some(Annotator::load_font(path)?),
        None => None,
    };
    Ok(Annotator::new(OverlayStyle {
        font,
        ..OverlayStyle::default()
    }))
}

fn build_processor(
    config: &AppConfig,
    models: Arc<SharedModels>,
    annotator: Annotator,
) -> Result<FrameProcessor> {
    let mesh = OnnxFaceMesh::load(&config.landmark_model_path, config.face_presence_threshold)?;
    Ok(FrameProcessor::new(Box::new(mesh), models)
        .with_annotator(annotator)
        .with_min_face_size(config.min_face_size))
}

#[cfg(feature = "camera")]
fn open_camera(config: &AppConfig) -> Result<Box<dyn FrameSource>> {
    let camera = emotion_stream::camera::CameraSource::open(
        config.camera_index,
        config.capture_width,
        config.capture_height,
        config.target_fps.max(1),
    )?;
    Ok(Box::new(camera))
}

#[cfg(not(feature = "camera"))]
fn open_camera(_config: &AppConfig) -> Result<Box<dyn FrameSource>> {
    Err(EmotionStreamError::Config(
        "no input_dir configured and camera support is not compiled in".to_string(),
    ))
}

/// Image directory when one is configured, otherwise the camera.
fn open_source(config: &AppConfig, looping: bool) -> Result<Box<dyn FrameSource>> {
    match &config.input_dir {
        Some(dir) => Ok(Box::new(ImageDirSource::open(dir)?.looping(looping))),
        None => open_camera(config),
    }
}

fn run_headless(config: &AppConfig, processor: FrameProcessor) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    let session = SessionState::new();

    let ctrl_c_session = session.clone();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_session.stop();
        }
    });

    let mut source = open_source(config, false)?;
    let mut display = SnapshotWriter::create(&config.output_dir)?;
    session.start();

    match config.delivery {
        DeliveryMode::Pull => {
            let mut controller =
                StreamController::new(processor, session).with_target_fps(config.target_fps);
            let report = controller.run_pull(&mut source, &mut display);
            if let SessionEnd::SourceUnavailable(e) = report.end {
                return Err(e);
            }
        }
        DeliveryMode::Push => {
            let push = PushSession::new(processor, session.clone())
                .with_deadline(config.frame_deadline());
            runtime.block_on(async {
                while push.session().is_running() {
                    let frame = match source.next_frame()? {
                        Some(frame) => frame,
                        None => break,
                    };
                    let delivery = push.on_frame_async(frame).await;
                    display.render(delivery.frame(), delivery.reading());
                }
                Ok::<_, EmotionStreamError>(())
            })?;
            let stats = push.stats();
            info!(
                "Push session ended: {} frames, {} classified, {} failed",
                stats.processed, stats.classified, stats.failed
            );
        }
    }

    info!(
        "Wrote {} annotated frames to {}",
        display.written(),
        config.output_dir.display()
    );
    Ok(())
}

#[cfg(feature = "gui")]
fn run_gui(config: AppConfig, models: Arc<SharedModels>, processor: FrameProcessor) -> Result<()> {
    use emotion_stream::feedback::FeedbackLog;
    use emotion_stream::ui::{EmotionStreamApp, FeedEvent, FrameFeed};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    let session = SessionState::new();
    let stats = processor.stats();
    let shutdown = Arc::new(AtomicBool::new(false));
    let (feed_sender, feed_receiver) = mpsc::channel::<FeedEvent>(4);

    // The camera is opened on the worker thread at each start.
    let worker = {
        let config = config.clone();
        let session = session.clone();
        let shutdown = shutdown.clone();
        std::thread::spawn(move || {
            let mut controller =
                StreamController::new(processor, session).with_target_fps(config.target_fps);
            let mut feed = FrameFeed::new(feed_sender);
            controller.run_sessions(|| open_source(&config, true), &mut feed, &shutdown);
        })
    };

    let app = EmotionStreamApp::new(
        session.clone(),
        models,
        stats,
        feed_receiver,
        FeedbackLog::new(&config.feedback_dir),
    );
    let result = eframe::run_native(
        "Emotion Stream",
        eframe::NativeOptions {
            viewport: egui::ViewportBuilder::default()
                .with_inner_size([1280.0, 800.0])
                .with_title("Emotion Stream"),
            ..Default::default()
        },
        Box::new(move |_cc| Ok(Box::new(app))),
    );

    if let Err(e) = result {
        error!("Application error: {}", e);
    }

    shutdown.store(true, Ordering::SeqCst);
    session.stop();
    if worker.join().is_err() {
        error!("Stream worker panicked");
    }
    Ok(())
}

fn main() -> Result<()> {
    let config = AppConfig::load()?;
    init_logging(&config.log_file)?;
    info!("Starting with {:?}", config);

    // Load failures end the program before any session starts.
    let labels = LabelMap::load(&config.label_map_path)?;
    let classifier = Arc::new(OnnxClassifier::load(&config.classifier_model_path)?);
    let models = SharedModels::new(labels, classifier).inspect_err(|e| error!("{}", e))?;

    let annotator = build_annotator(&config)?;
    let processor = build_processor(&config, models.clone(), annotator)?;

    #[cfg(feature = "gui")]
    if !config.headless {
        return run_gui(config, models, processor);
    }

    run_headless(&config, processor)
}
