// Desktop surface: live annotated video, start/stop, probability readout, feedback forms

use crate::emotion::{FrameStats, SharedModels};
use crate::feedback::{FeedbackLog, MisclassificationReport};
use crate::models::{EmotionReading, Frame};
use crate::session::SessionState;
use crate::stream::{DisplaySurface, SessionReport};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// What the stream worker tells the window.
#[derive(Debug)]
pub enum FeedEvent {
    Frame {
        frame: Frame,
        reading: Option<EmotionReading>,
    },
    SessionEnded {
        failed: bool,
        message: String,
    },
}

/// Display surface that hands frames to the window through a bounded
/// channel. Frames the window has not caught up with are dropped.
pub struct FrameFeed {
    sender: mpsc::Sender<FeedEvent>,
}

impl FrameFeed {
    pub fn new(sender: mpsc::Sender<FeedEvent>) -> Self {
        Self { sender }
    }
}

impl DisplaySurface for FrameFeed {
    fn render(&mut self, frame: &Frame, reading: Option<&EmotionReading>) {
        let _ = self.sender.try_send(FeedEvent::Frame {
            frame: frame.clone(),
            reading: reading.cloned(),
        });
    }

    fn session_ended(&mut self, report: &SessionReport) {
        let message = if report.end.is_failure() {
            format!("{:?}", report.end)
        } else {
            format!("Session ended after {} frames", report.frames)
        };
        if self
            .sender
            .try_send(FeedEvent::SessionEnded {
                failed: report.end.is_failure(),
                message,
            })
            .is_err()
        {
            warn!("Window did not receive the session end notice");
        }
    }
}

#[derive(Default)]
struct FeedbackForm {
    thought: String,
    student_id: String,
    incorrect_label: String,
    reason: String,
    notice: Option<Result<String, String>>,
    reports: Vec<MisclassificationReport>,
    thoughts: String,
}

/// Main application window
pub struct EmotionStreamApp {
    session: SessionState,
    models: Arc<SharedModels>,
    stats: Arc<FrameStats>,
    events: mpsc::Receiver<FeedEvent>,
    feedback: FeedbackLog,
    camera_texture: Option<egui::TextureHandle>,
    current_reading: Option<EmotionReading>,
    status: Option<(bool, String)>,
    form: FeedbackForm,
}

impl EmotionStreamApp {
    pub fn new(
        session: SessionState,
        models: Arc<SharedModels>,
        stats: Arc<FrameStats>,
        events: mpsc::Receiver<FeedEvent>,
        feedback: FeedbackLog,
    ) -> Self {
        Self {
            session,
            models,
            stats,
            events,
            feedback,
            camera_texture: None,
            current_reading: None,
            status: None,
            form: FeedbackForm::default(),
        }
    }

    /// Drains the feed, keeping only the newest frame as a texture.
    fn drain_events(&mut self, ctx: &egui::Context) {
        let mut latest = None;
        while let Ok(event) = self.events.try_recv() {
            match event {
                FeedEvent::Frame { frame, reading } => latest = Some((frame, reading)),
                FeedEvent::SessionEnded { failed, message } => {
                    self.status = Some((failed, message));
                }
            }
        }

        if let Some((frame, reading)) = latest {
            let rgb = frame.to_rgb();
            let color_image =
                egui::ColorImage::from_rgb([rgb.width as usize, rgb.height as usize], &rgb.data);
            self.camera_texture =
                Some(ctx.load_texture("camera", color_image, egui::TextureOptions::LINEAR));
            self.current_reading = reading;
        }
    }

    fn render_controls(&mut self, ctx: &egui::Context) {
        egui::TopBottomPanel::top("controls").show(ctx, |ui| {
            ui.horizontal(|ui| {
                let running = self.session.is_running();
                if ui
                    .add_enabled(!running, egui::Button::new("Start Emotion Analysis"))
                    .clicked()
                {
                    self.status = None;
                    self.session.start();
                }
                if ui
                    .add_enabled(running, egui::Button::new("Stop Emotion Analysis"))
                    .clicked()
                {
                    self.session.stop();
                }

                ui.separator();
                if running {
                    let stats = self.stats.snapshot();
                    ui.label(format!(
                        "{} frames, {} classified, {} failed",
                        stats.processed, stats.classified, stats.failed
                    ));
                } else {
                    match &self.status {
                        Some((true, message)) => {
                            ui.colored_label(egui::Color32::RED, message);
                        }
                        Some((false, message)) => {
                            ui.label(message);
                        }
                        None => {
                            ui.label("Emotion analysis is stopped");
                        }
                    }
                }
            });
        });
    }

    fn render_readout(&self, ui: &mut egui::Ui) {
        ui.heading("Emotion");
        match &self.current_reading {
            Some(reading) => {
                ui.label(reading.to_string());
                for (label, p) in self.models.labels().readout(&reading.probabilities) {
                    ui.add(egui::ProgressBar::new(p).text(format!("{label} {:.0}%", p * 100.0)));
                }
            }
            None => {
                ui.label("No face in view");
            }
        }
    }

    fn render_feedback(&mut self, ui: &mut egui::Ui) {
        let form = &mut self.form;

        ui.heading("Can a machine read emotions?");
        ui.text_edit_multiline(&mut form.thought);
        if ui.button("Submit").clicked() {
            form.notice = Some(match self.feedback.submit_thought(&form.thought) {
                Ok(()) => {
                    form.thought.clear();
                    Ok("Thought submitted".to_string())
                }
                Err(e) => Err(e.to_string()),
            });
        }

        ui.separator();
        ui.heading("Report a wrong analysis");
        ui.label("Student ID");
        ui.text_edit_singleline(&mut form.student_id);
        ui.label("Incorrectly detected emotion");
        ui.text_edit_multiline(&mut form.incorrect_label);
        ui.label("Reason");
        ui.text_edit_multiline(&mut form.reason);
        if ui.button("Submit Feedback").clicked() {
            let result = self.feedback.submit_report(
                &form.student_id,
                &form.incorrect_label,
                &form.reason,
            );
            form.notice = Some(match result {
                Ok(()) => {
                    form.incorrect_label.clear();
                    form.reason.clear();
                    Ok("Feedback submitted".to_string())
                }
                Err(e) => Err(e.to_string()),
            });
        }

        match &form.notice {
            Some(Ok(message)) => {
                ui.colored_label(egui::Color32::GREEN, message);
            }
            Some(Err(message)) => {
                ui.colored_label(egui::Color32::RED, message);
            }
            None => {}
        }

        ui.separator();
        ui.collapsing("Stored feedback", |ui| {
            if ui.button("Refresh").clicked() {
                form.thoughts = self
                    .feedback
                    .read_thoughts()
                    .unwrap_or_else(|e| e.to_string());
                form.reports = match self.feedback.read_reports() {
                    Ok(reports) => reports,
                    Err(e) => {
                        form.notice = Some(Err(e.to_string()));
                        Vec::new()
                    }
                };
            }
            ui.label(&form.thoughts);
            egui::Grid::new("reports").striped(true).show(ui, |ui| {
                ui.strong("Student");
                ui.strong("Incorrect analysis");
                ui.strong("Reason");
                ui.end_row();
                for report in &form.reports {
                    ui.label(&report.student_id);
                    ui.label(&report.incorrect_label);
                    ui.label(&report.reason);
                    ui.end_row();
                }
            });
        });
    }

    /// Renders the camera view, scaled to fit and centered
    fn render_camera_view(&self, ctx: &egui::Context) {
        egui::CentralPanel::default()
            .frame(egui::Frame::none())
            .show(ctx, |ui| {
                let available_size = ui.available_size();
                let Some(texture) = &self.camera_texture else {
                    return;
                };

                let texture_size = texture.size_vec2();
                let aspect_ratio = texture_size.x / texture_size.y;

                let mut display_width = available_size.x;
                let mut display_height = display_width / aspect_ratio;
                if display_height > available_size.y {
                    display_height = available_size.y;
                    display_width = display_height * aspect_ratio;
                }

                let x_offset = (available_size.x - display_width) / 2.0;
                let y_offset = (available_size.y - display_height) / 2.0;

                ui.put(
                    egui::Rect::from_min_size(
                        egui::pos2(x_offset, y_offset),
                        egui::vec2(display_width, display_height),
                    ),
                    egui::Image::new(texture)
                        .fit_to_exact_size(egui::vec2(display_width, display_height)),
                );
            });
    }
}

impl eframe::App for EmotionStreamApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        ctx.request_repaint();

        self.drain_events(ctx);

        self.render_controls(ctx);
        egui::SidePanel::right("side").min_width(300.0).show(ctx, |ui| {
            egui::ScrollArea::vertical().show(ui, |ui| {
                self.render_readout(ui);
                ui.separator();
                self.render_feedback(ui);
            });
        });
        self.render_camera_view(ctx);
    }
}
