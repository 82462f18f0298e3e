// The generation orchestrator.
//
// One generation is a sequence of expensive stages: base synthesis, face
// refinement, hand refinement, optional upscaling. All of them run on a
// dedicated blocking context, serialized onto the single accelerator by a
// one-permit gate. Progress flows back through a bounded channel; the
// caches decide per stage whether the previous result can be replayed.
//
// Cache policy, in one place:
//   - an entry is only reusable when the request has a seed (otherwise the
//     trajectory is not reproducible),
//   - a stage may only reuse its entry when everything upstream was itself
//     reused (a recompute cascades downward),
//   - the face entry additionally requires an identical scaled descriptor,
//   - hand refinement is never cached,
//   - writes are committed only when the whole request succeeds, so aborted
//     and failed generations leave no entries behind.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_stream::try_stream;
use futures::{Stream, StreamExt};
use image::RgbaImage;
use log::{debug, info, trace, warn};
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use crate::backend::{Configuration, Generator, Loader};
use crate::cache::{Entry, StageCaches};
use crate::detail;
use crate::detector::DetectorProxy;
use crate::error::{self, Error};
use crate::params::Job;
use crate::pixels::{self, Rectangle};
use crate::resident::Resident;
use crate::upscale::UpscaleStage;

/// Refinement budgets: one face, two hands.
const MAX_FACES: usize = 1;
const MAX_HANDS: usize = 2;

/// Previews allowed to queue up for a slow session before we start
/// dropping them. The final result never travels through this channel.
const PREVIEW_DEPTH: usize = 8;

/// generate() returns a stream of these.
#[derive(Debug)]
pub enum Event {
    /// A blurred, in-flight preview.
    Preview { ratio: f32, image: RgbaImage },
    /// The finished product. Always the last event of a successful run.
    Completed(Generation),
    /// Something broke, or the caller hung up. The stream ends here.
    Error(Error),
}

#[derive(Clone)]
pub struct Generation {
    pub image: RgbaImage,
    pub faces: Vec<Rectangle>,
    pub hands: Vec<Rectangle>,
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field(
                "image",
                &format!("{}x{}", self.image.width(), self.image.height()),
            )
            .field("faces", &self.faces)
            .field("hands", &self.hands)
            .finish()
    }
}

/// Detection weight paths, resolved once at startup.
#[derive(Debug, Clone)]
pub struct DetectorWeights {
    pub face: PathBuf,
    pub hand: PathBuf,
}

/// What the relay loop saw first: a preview, a drained channel, or the
/// pipeline finishing.
enum Next {
    Event(Event),
    Drained,
    Finished(std::result::Result<Result<Generation, Error>, tokio::task::JoinError>),
}

/// Process-wide mutable pipeline state: the resident model, the stage
/// caches, the upscaler, and the detection channel. Only ever touched while
/// the gate is held.
struct Engine {
    resident: Resident,
    caches: StageCaches,
    upscaler: UpscaleStage,
    detector: DetectorProxy,
    weights: DetectorWeights,
}

#[derive(Clone)]
pub struct GeneratorModule {
    gate: Arc<Semaphore>,
    engine: Arc<Mutex<Engine>>,
}

impl GeneratorModule {
    pub fn new(
        loader: Arc<dyn Loader>,
        detector: DetectorProxy,
        weights: DetectorWeights,
        upscaler_weights_dir: PathBuf,
    ) -> Self {
        Self {
            gate: Arc::new(Semaphore::new(1)),
            engine: Arc::new(Mutex::new(Engine {
                resident: Resident::new(loader.clone()),
                caches: StageCaches::default(),
                upscaler: UpscaleStage::new(loader, upscaler_weights_dir),
                detector,
                weights,
            })),
        }
    }

    /// Runs one generation and returns its progress stream. The pipeline
    /// blocks a dedicated worker context; this stream only relays, so the
    /// event loop stays responsive while the accelerator is busy. Setting
    /// `cancelled` makes the pipeline unwind at the next step boundary.
    pub fn generate(
        &self,
        job: Job,
        cancelled: Arc<AtomicBool>,
    ) -> impl Stream<Item = Event> + Send {
        let this = self.clone();

        let stream = try_stream! {
            let id = Uuid::new_v4();
            info!(
                "[{id}] Queued: {:?} on {}",
                job.parameters.prompt,
                job.parameters.model.display()
            );

            // The gate serializes every pipeline against the shared
            // accelerator. The permit rides inside the blocking task so it
            // is released on every exit path, including unwinds.
            let permit = this.gate.clone().acquire_owned().await.expect("gate closed");
            debug!("[{id}] Holding the gate");

            let started = Instant::now();
            let (events, mut rx) = mpsc::channel(PREVIEW_DEPTH);
            let engine = Arc::clone(&this.engine);
            let mut task = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let mut progress = Progress::new(events, cancelled, job.preview_after);
                let mut engine = engine.lock().expect("engine mutex poisoned");
                engine.run(&job, &mut progress)
            });

            let result = loop {
                let next = tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => Next::Event(event),
                        None => Next::Drained,
                    },
                    result = &mut task => Next::Finished(result),
                };

                match next {
                    Next::Event(event) => yield event,
                    Next::Drained => break (&mut task).await,
                    Next::Finished(result) => break result,
                }
            };

            // The channel may still hold previews that raced in before the
            // pipeline finished; flush them ahead of the terminal event.
            while let Ok(event) = rx.try_recv() {
                yield event;
            }

            let generation = result
                .expect("generation task panicked")
                .map_err(|error| {
                    match &error {
                        Error::Interrupted => info!("[{id}] Aborted: caller disconnected"),
                        error => warn!("[{id}] Failed after {:.2?}: {error}", started.elapsed()),
                    }
                    error
                })?;

            info!("[{id}] Generated in {:.2?}", started.elapsed());
            yield Event::Completed(generation);
        };

        stream.map(|result| result.unwrap_or_else(Event::Error))
    }
}

impl Engine {
    fn run(&mut self, job: &Job, progress: &mut Progress) -> Result<Generation, Error> {
        let parameters = &job.parameters;
        let state = self
            .resident
            .ensure(parameters, job.cpu_offload, &mut self.caches)?;

        let prompt = state
            .encoder
            .encode(&parameters.prompt)
            .map_err(|error| error::stage("encode", error))?;
        let negative_prompt = state
            .encoder
            .encode(&parameters.negative_prompt)
            .map_err(|error| error::stage("encode", error))?;

        let (width, height) = parameters.resolution();
        let factor = parameters.quality.multiplier();
        let steps = parameters.steps;
        let mut configuration = Configuration {
            steps,
            guidance: parameters.guidance,
            width,
            height,
            prompt,
            negative_prompt,
            generator: Generator::from_seed(parameters.seed),
        };

        // Deferred cache writes, committed on success only.
        let mut base_write = None;
        let mut face_write = None;

        // Base stage.
        let fresh;
        let mut image = if let Some(entry) = self
            .caches
            .base
            .as_ref()
            .filter(|entry| parameters.seed.is_some() && entry.key == *parameters)
        {
            fresh = false;
            debug!("Replaying the cached base image");
            configuration.generator.restore(&entry.generator);
            entry.value.clone()
        } else {
            fresh = true;
            let image = state
                .pipeline
                .sample(&mut configuration, &mut |step, preview| {
                    progress.step(step, steps, preview)
                })
                .map_err(|error| error::stage("base", error))?;

            if parameters.seed.is_some() {
                base_write = Some(Entry {
                    key: parameters.clone(),
                    value: image.clone(),
                    generator: configuration.generator.state(),
                });
            } else {
                // Nothing about this run can ever be replayed.
                self.caches.invalidate();
            }
            // Whatever face entry existed belongs to the previous base.
            self.caches.face = None;

            image
        };

        // Face stage.
        let mut faces = Vec::new();
        if let Some(detail) = &job.face_detail {
            let detail = detail.scaled(factor);

            if let Some(entry) = self
                .caches
                .face
                .as_ref()
                .filter(|entry| !fresh && entry.key == detail)
            {
                debug!("Replaying the cached face refinement");
                configuration.generator.restore(&entry.generator);
                (image, faces) = entry.value.clone();
            } else {
                (image, faces) = detail::refine(
                    "face",
                    &self.weights.face,
                    &detail,
                    &mut configuration,
                    image,
                    state.pipeline.as_mut(),
                    &self.detector,
                    MAX_FACES,
                    &mut |step, preview| progress.step(step, steps, preview),
                )?;

                if parameters.seed.is_some() {
                    face_write = Some(Entry {
                        key: detail,
                        value: (image.clone(), faces.clone()),
                        generator: configuration.generator.state(),
                    });
                }
            }
        }

        // Hand stage. Never cached; recomputed on every request.
        let mut hands = Vec::new();
        if let Some(detail) = &job.hand_detail {
            let detail = detail.scaled(factor);

            (image, hands) = detail::refine(
                "hand",
                &self.weights.hand,
                &detail,
                &mut configuration,
                image,
                state.pipeline.as_mut(),
                &self.detector,
                MAX_HANDS,
                &mut |step, preview| progress.step(step, steps, preview),
            )?;
        }

        // Optional upscale, with the region metadata following the image
        // into the larger coordinate space.
        let (image, faces, hands) = match &job.upscaler {
            Some(upscaler) => {
                self.upscaler
                    .run(upscaler, image, faces, hands, &mut |ratio, preview| {
                        progress.report(ratio, preview)
                    })?
            }
            None => (image, faces, hands),
        };

        if let Some(entry) = base_write {
            self.caches.base = Some(entry);
        }
        if let Some(entry) = face_write {
            self.caches.face = Some(entry);
        }

        Ok(Generation {
            image,
            faces,
            hands,
        })
    }
}

/// Carries per-step progress from the worker context to the session:
/// polls for cancellation, clamps ratios so they never regress, filters
/// previews below the requested threshold, and drops previews rather than
/// stalling the pipeline behind a slow reader.
struct Progress {
    events: mpsc::Sender<Event>,
    cancelled: Arc<AtomicBool>,
    preview_after: f32,
    high_water: f32,
}

impl Progress {
    fn new(events: mpsc::Sender<Event>, cancelled: Arc<AtomicBool>, preview_after: f32) -> Self {
        Self {
            events,
            cancelled,
            preview_after,
            high_water: 0.0,
        }
    }

    /// Called at every step boundary. An `Err` here is the cooperative
    /// abort: the in-flight accelerator call cannot be preempted, but no
    /// further steps run.
    fn report(&mut self, ratio: f32, image: &RgbaImage) -> Result<(), Error> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(Error::Interrupted);
        }

        // Refinement stages restart their step counters; delivered ratios
        // must not regress.
        let ratio = ratio.max(self.high_water);
        self.high_water = ratio;

        if ratio <= self.preview_after {
            return Ok(());
        }

        let preview = Event::Preview {
            ratio,
            image: pixels::preview(image),
        };
        if self.events.try_send(preview).is_err() {
            trace!("Preview at {ratio:.2} dropped");
        }

        Ok(())
    }

    fn step(&mut self, step: u32, steps: u32, image: &RgbaImage) -> anyhow::Result<()> {
        Ok(self.report(step as f32 / steps as f32, image)?)
    }
}
