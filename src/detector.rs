// Bridge to the long-lived region-detection worker.
//
// Detection runs in its own worker with its own weights, separate from the
// generation pipeline. The proxy is a strict single request/single response
// channel pair: the generation worker blocks on the reply, and a severed
// channel surfaces as `DetectorUnavailable` rather than a hang. There is no
// automatic restart.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;

use image::RgbaImage;
use log::info;
use tokio::sync::mpsc;

use crate::backend::{Detector, Prediction};
use crate::error::{Error, Result};

type Job = (PathBuf, RgbaImage);
type Verdict = anyhow::Result<Prediction>;

pub struct DetectorProxy {
    channel: Mutex<Channel>,
}

struct Channel {
    jobs: mpsc::Sender<Job>,
    verdicts: mpsc::Receiver<Verdict>,
}

impl DetectorProxy {
    /// Spawns the worker that owns the detection backend. Called once at
    /// process startup; the worker is expected to outlive every request.
    pub fn spawn(mut detector: Box<dyn Detector>) -> Self {
        let (jobs, mut job_rx) = mpsc::channel::<Job>(1);
        let (verdict_tx, verdicts) = mpsc::channel::<Verdict>(1);

        thread::Builder::new()
            .name("detector".to_owned())
            .spawn(move || {
                info!("Detection worker started");
                while let Some((weights, image)) = job_rx.blocking_recv() {
                    let verdict = detector.detect(&weights, &image);
                    if verdict_tx.blocking_send(verdict).is_err() {
                        break;
                    }
                }
                info!("Detection worker stopped");
            })
            .expect("failed to spawn detection worker");

        Self {
            channel: Mutex::new(Channel { jobs, verdicts }),
        }
    }

    /// Runs one detection pass. At most one request may be outstanding;
    /// the lock makes a second caller wait its turn. Must be called from a
    /// blocking context, never the event loop.
    pub fn detect(&self, weights: &Path, image: &RgbaImage) -> Result<Prediction> {
        let mut channel = self
            .channel
            .lock()
            .map_err(|_| Error::DetectorUnavailable)?;

        channel
            .jobs
            .blocking_send((weights.to_owned(), image.clone()))
            .map_err(|_| Error::DetectorUnavailable)?;

        match channel.verdicts.blocking_recv() {
            Some(Ok(prediction)) => Ok(prediction),
            Some(Err(error)) => Err(Error::Detection(error)),
            None => Err(Error::DetectorUnavailable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixels::Rectangle;

    struct Scripted {
        boxes: Vec<Rectangle>,
    }

    impl Detector for Scripted {
        fn detect(&mut self, _weights: &Path, image: &RgbaImage) -> anyhow::Result<Prediction> {
            Ok(Prediction {
                boxes: self.boxes.clone(),
                masks: self
                    .boxes
                    .iter()
                    .map(|_| image::GrayImage::new(image.width(), image.height()))
                    .collect(),
            })
        }
    }

    struct Failing;

    impl Detector for Failing {
        fn detect(&mut self, _weights: &Path, _image: &RgbaImage) -> anyhow::Result<Prediction> {
            anyhow::bail!("weights corrupted")
        }
    }

    struct Dying;

    impl Detector for Dying {
        fn detect(&mut self, _weights: &Path, _image: &RgbaImage) -> anyhow::Result<Prediction> {
            panic!("detector crashed")
        }
    }

    #[test]
    fn test_round_trip() {
        let boxes = vec![Rectangle::new(1.0, 2.0, 3.0, 4.0)];
        let proxy = DetectorProxy::spawn(Box::new(Scripted {
            boxes: boxes.clone(),
        }));

        let prediction = proxy
            .detect(Path::new("face.pt"), &RgbaImage::new(4, 4))
            .unwrap();

        assert_eq!(prediction.boxes, boxes);
        assert_eq!(prediction.masks.len(), 1);

        // The channel stays usable for the next request.
        let prediction = proxy
            .detect(Path::new("face.pt"), &RgbaImage::new(4, 4))
            .unwrap();
        assert_eq!(prediction.boxes, boxes);
    }

    #[test]
    fn test_detection_failure_is_not_fatal() {
        let proxy = DetectorProxy::spawn(Box::new(Failing));

        let result = proxy.detect(Path::new("face.pt"), &RgbaImage::new(4, 4));
        assert!(matches!(result, Err(Error::Detection(_))));

        // The worker survives a failed pass.
        let result = proxy.detect(Path::new("face.pt"), &RgbaImage::new(4, 4));
        assert!(matches!(result, Err(Error::Detection(_))));
    }

    #[test]
    fn test_dead_worker_reports_unavailable() {
        let proxy = DetectorProxy::spawn(Box::new(Dying));

        for _ in 0..2 {
            let result = proxy.detect(Path::new("face.pt"), &RgbaImage::new(4, 4));
            assert!(matches!(result, Err(Error::DetectorUnavailable)));
        }
    }
}
