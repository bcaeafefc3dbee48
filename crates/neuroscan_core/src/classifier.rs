//! The pluggable decision step scheduled by a classification job.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::ClassificationError;
use crate::outcome::Label;
use crate::pipeline::NormalizedImage;

/// Cooperative cancellation flag shared between a job and its classifier call.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Anything that can turn a normalized image into a label.
///
/// Implementations may be slow. They should poll `cancel` when they can and
/// return [`ClassificationError::Abandoned`] once it is set; a result that
/// arrives after cancellation is discarded by the job anyway.
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    fn classify(
        &self,
        image: &NormalizedImage,
        cancel: &CancelToken,
    ) -> Result<Label, ClassificationError>;
}

/// Subtypes the simulated model picks from before collapsing to a [`Label`].
const SUBTYPES: [&str; 4] = ["glioma", "meningioma", "pituitary", "no_tumor"];

const SLEEP_SLICE: Duration = Duration::from_millis(20);

/// Stand-in model: waits `delay`, then draws a random tumour subtype.
pub struct SimulatedClassifier {
    delay: Duration,
    rng: Mutex<StdRng>,
}

impl SimulatedClassifier {
    pub fn new(delay: Duration, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            delay,
            rng: Mutex::new(rng),
        }
    }

    fn draw_subtype(&self) -> &'static str {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        SUBTYPES.choose(&mut *rng).copied().unwrap_or("no_tumor")
    }
}

fn subtype_label(subtype: &str) -> Label {
    if subtype == "no_tumor" {
        Label::NoTumor
    } else {
        Label::Tumor
    }
}

impl Classifier for SimulatedClassifier {
    fn name(&self) -> &str {
        "simulated"
    }

    fn classify(
        &self,
        image: &NormalizedImage,
        cancel: &CancelToken,
    ) -> Result<Label, ClassificationError> {
        tracing::debug!(
            width = image.width(),
            height = image.height(),
            delay_ms = self.delay.as_millis() as u64,
            "simulated classifier running"
        );
        let deadline = Instant::now() + self.delay;
        loop {
            if cancel.is_cancelled() {
                return Err(ClassificationError::Abandoned);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
        let subtype = self.draw_subtype();
        tracing::debug!(subtype, "simulated classifier picked subtype");
        Ok(subtype_label(subtype))
    }
}
