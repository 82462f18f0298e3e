// Per-stage memoization for the expensive pipeline stages.
//
// An entry is only worth keeping when the request is reproducible (it has a
// seed) and the stage's upstream input did not change; the orchestrator
// enforces both. What lives here is the storage and the invalidation rules.

use image::RgbaImage;

use crate::backend::GeneratorState;
use crate::params::{Detail, Parameters};
use crate::pixels::Rectangle;

/// A memoized stage output plus the generator state captured right after it
/// was produced. Restoring that state before running downstream stages makes
/// a cache hit bit-identical to a recompute.
#[derive(Debug)]
pub struct Entry<T, K> {
    pub key: K,
    pub value: T,
    pub generator: GeneratorState,
}

/// The cache tiers. Base and face results are memoized; hand refinement is
/// deliberately recomputed on every request.
#[derive(Default)]
pub struct StageCaches {
    pub base: Option<Entry<RgbaImage, Parameters>>,
    pub face: Option<Entry<(RgbaImage, Vec<Rectangle>), Detail>>,
}

impl StageCaches {
    /// Model-boundary invalidation: a swap of weights or adapters obsoletes
    /// every tier at once.
    pub fn invalidate(&mut self) {
        self.base = None;
        self.face = None;
    }

    /// A sampler change obsoletes the sampling trajectory but not the
    /// resident weights. Downstream tiers fall out through the
    /// upstream-recompute cascade, not here.
    pub fn invalidate_base(&mut self) {
        self.base = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Generator;

    fn entry() -> Entry<RgbaImage, Detail> {
        Entry {
            key: Detail {
                strength: 30,
                padding: 16.0,
                max_area: None,
            },
            value: RgbaImage::new(2, 2),
            generator: Generator::from_seed(Some(1)).state(),
        }
    }

    #[test]
    fn test_invalidate_clears_every_tier() {
        let mut caches = StageCaches::default();
        let Entry {
            key,
            value,
            generator,
        } = entry();
        caches.face = Some(Entry {
            key,
            value: (value, Vec::new()),
            generator,
        });

        caches.invalidate();
        assert!(caches.base.is_none());
        assert!(caches.face.is_none());
    }

    #[test]
    fn test_invalidate_base_keeps_face() {
        let mut caches = StageCaches::default();
        let Entry {
            key,
            value,
            generator,
        } = entry();
        caches.face = Some(Entry {
            key,
            value: (value, Vec::new()),
            generator,
        });

        caches.invalidate_base();
        assert!(caches.base.is_none());
        assert!(caches.face.is_some());
    }
}
