// Tracks what is loaded on the accelerator and reloads only on change.
//
// The resident model is the outermost cache boundary: swapping weights or
// adapters obsoletes every stage cache, while a sampler change is an
// in-place strategy swap that only costs the base-image cache.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};

use crate::backend::{Loader, Pipeline, TextEncoder};
use crate::cache::StageCaches;
use crate::error::{Error, Result};
use crate::params::{Lora, Parameters, Sampler};

/// The accelerator-resident configuration and its live handles.
pub struct ResidentState {
    pub model: PathBuf,
    pub loras: Vec<Lora>,
    pub cpu_offload: bool,
    pub sampler: Sampler,
    pub pipeline: Box<dyn Pipeline>,
    pub encoder: Box<dyn TextEncoder>,
}

pub struct Resident {
    loader: Arc<dyn Loader>,
    state: Option<ResidentState>,
}

impl Resident {
    pub fn new(loader: Arc<dyn Loader>) -> Self {
        Self {
            loader,
            state: None,
        }
    }

    /// Makes the requested model, adapters, sampler, and offload mode
    /// resident, reloading as little as possible. On a load failure the
    /// resident state stays cleared, so the next request retries from
    /// scratch.
    pub fn ensure<'a>(
        &'a mut self,
        parameters: &Parameters,
        cpu_offload: bool,
        caches: &mut StageCaches,
    ) -> Result<&'a mut ResidentState> {
        // Fused adapters cannot be un-fused in place, so an adapter change
        // costs as much as a model change.
        let reload = match &self.state {
            None => true,
            Some(state) => {
                state.model != parameters.model
                    || state.loras != parameters.loras
                    || state.cpu_offload != cpu_offload
            }
        };

        if reload {
            // Release the previous weights before loading the next set; both
            // will not fit at once.
            if self.state.take().is_some() {
                debug!("Releasing resident pipeline");
            }
            caches.invalidate();

            info!("Loading {}", parameters.model.display());
            let start = Instant::now();
            let loaded = self
                .loader
                .load(&parameters.model, &parameters.loras, cpu_offload)
                .and_then(|(mut pipeline, encoder)| {
                    if !parameters.loras.is_empty() {
                        info!("Fused {} LoRA(s)", parameters.loras.len());
                    }
                    pipeline.set_sampler(parameters.sampler)?;
                    Ok((pipeline, encoder))
                });

            let (pipeline, encoder) = loaded.map_err(|source| Error::ModelLoad {
                model: parameters.model.display().to_string(),
                source,
            })?;
            info!(
                "Loaded {} in {:.2?}",
                parameters.model.display(),
                start.elapsed()
            );

            self.state = Some(ResidentState {
                model: parameters.model.clone(),
                loras: parameters.loras.clone(),
                cpu_offload,
                sampler: parameters.sampler,
                pipeline,
                encoder,
            });
        } else {
            let swap = self
                .state
                .as_ref()
                .map_or(false, |state| state.sampler != parameters.sampler);

            if swap {
                if let Some(mut state) = self.state.take() {
                    debug!(
                        "Swapping sampler {:?} -> {:?}",
                        state.sampler, parameters.sampler
                    );

                    match state.pipeline.set_sampler(parameters.sampler) {
                        Ok(()) => {
                            state.sampler = parameters.sampler;
                            self.state = Some(state);
                            caches.invalidate_base();
                        }
                        Err(source) => {
                            // The scheduler is in an unknown state; force a
                            // clean reload on the next request.
                            caches.invalidate();
                            return Err(Error::ModelLoad {
                                model: parameters.model.display().to_string(),
                                source,
                            });
                        }
                    }
                }
            }
        }

        Ok(self
            .state
            .as_mut()
            .expect("resident state present after ensure"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Detector, Generator, Scaler};
    use crate::cache::Entry;
    use crate::params::{Quality, Upscaling};
    use crate::software::SoftwareLoader;

    use std::io::Write;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLoader {
        inner: SoftwareLoader,
        loads: Arc<AtomicUsize>,
    }

    impl Loader for CountingLoader {
        fn load(
            &self,
            model: &Path,
            loras: &[Lora],
            cpu_offload: bool,
        ) -> anyhow::Result<(Box<dyn Pipeline>, Box<dyn TextEncoder>)> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.inner.load(model, loras, cpu_offload)
        }

        fn load_scaler(
            &self,
            model: Upscaling,
            weights_dir: &Path,
        ) -> anyhow::Result<Box<dyn Scaler>> {
            self.inner.load_scaler(model, weights_dir)
        }

        fn load_detector(&self) -> anyhow::Result<Box<dyn Detector>> {
            self.inner.load_detector()
        }
    }

    fn fixture() -> (tempfile::TempDir, Resident, Arc<AtomicUsize>) {
        let dir = tempfile::tempdir().unwrap();
        for name in ["anime", "photoreal"] {
            std::fs::File::create(dir.path().join(format!("{name}.safetensors")))
                .unwrap()
                .write_all(b"weights")
                .unwrap();
        }

        let loads = Arc::new(AtomicUsize::new(0));
        let resident = Resident::new(Arc::new(CountingLoader {
            inner: SoftwareLoader::new(),
            loads: loads.clone(),
        }));

        (dir, resident, loads)
    }

    fn parameters(dir: &Path, model: &str) -> Parameters {
        Parameters {
            model: dir.join(format!("{model}.safetensors")),
            prompt: "a lighthouse".to_owned(),
            negative_prompt: String::new(),
            width: 8,
            height: 8,
            quality: Quality::Low,
            steps: 2,
            guidance: 5.0,
            seed: Some(7),
            loras: Vec::new(),
            sampler: Sampler::EulerAncestral,
        }
    }

    fn cached(caches: &mut StageCaches) {
        caches.base = Some(Entry {
            key: parameters(Path::new("/"), "anime"),
            value: image::RgbaImage::new(2, 2),
            generator: Generator::from_seed(Some(1)).state(),
        });
        caches.face = Some(Entry {
            key: crate::params::Detail {
                strength: 30,
                padding: 16.0,
                max_area: None,
            },
            value: (image::RgbaImage::new(2, 2), Vec::new()),
            generator: Generator::from_seed(Some(1)).state(),
        });
    }

    #[test]
    fn test_same_model_loads_once() {
        let (dir, mut resident, loads) = fixture();
        let mut caches = StageCaches::default();
        let parameters = parameters(dir.path(), "anime");

        resident.ensure(&parameters, false, &mut caches).unwrap();
        resident.ensure(&parameters, false, &mut caches).unwrap();

        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sampler_change_swaps_in_place() {
        let (dir, mut resident, loads) = fixture();
        let mut caches = StageCaches::default();
        let mut parameters = parameters(dir.path(), "anime");

        resident.ensure(&parameters, false, &mut caches).unwrap();
        cached(&mut caches);

        parameters.sampler = Sampler::Dpm2mKarras;
        let state = resident.ensure(&parameters, false, &mut caches).unwrap();

        assert_eq!(state.sampler, Sampler::Dpm2mKarras);
        // No reload, but the sampling trajectory is void.
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(caches.base.is_none());
        assert!(caches.face.is_some());
    }

    #[test]
    fn test_model_change_reloads_and_invalidates() {
        let (dir, mut resident, loads) = fixture();
        let mut caches = StageCaches::default();

        resident
            .ensure(&parameters(dir.path(), "anime"), false, &mut caches)
            .unwrap();
        cached(&mut caches);

        resident
            .ensure(&parameters(dir.path(), "photoreal"), false, &mut caches)
            .unwrap();

        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert!(caches.base.is_none());
        assert!(caches.face.is_none());
    }

    #[test]
    fn test_adapter_change_is_a_full_reload() {
        let (dir, mut resident, loads) = fixture();
        let mut caches = StageCaches::default();
        let mut parameters = parameters(dir.path(), "anime");

        resident.ensure(&parameters, false, &mut caches).unwrap();
        parameters.loras = vec![Lora {
            path: "detail.safetensors".to_owned(),
            strength: 80,
        }];
        resident.ensure(&parameters, false, &mut caches).unwrap();

        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_offload_change_is_a_full_reload() {
        let (dir, mut resident, loads) = fixture();
        let mut caches = StageCaches::default();
        let parameters = parameters(dir.path(), "anime");

        resident.ensure(&parameters, false, &mut caches).unwrap();
        resident.ensure(&parameters, true, &mut caches).unwrap();

        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failed_load_retries_next_time() {
        let (dir, mut resident, loads) = fixture();
        let mut caches = StageCaches::default();

        let missing = parameters(dir.path(), "missing");
        assert!(matches!(
            resident.ensure(&missing, false, &mut caches),
            Err(Error::ModelLoad { .. })
        ));

        resident
            .ensure(&parameters(dir.path(), "anime"), false, &mut caches)
            .unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }
}
