use std::path::Path;

use candle_core::{backprop::GradStore, Tensor, Var};

use crate::dataset::collator::EncodedBatch;
use crate::error::FinetuneError;

/// The acoustic model seam. The architecture, its forward/backward pass and
/// its checkpoint format live behind this trait; the training-step engine
/// and trainer loop only orchestrate calls into it.
pub trait CtcModel: Send {
    /// Loss for one batch. `train` enables training-time behavior such as
    /// dropout. Returns a rank-0 tensor under single-replica execution, or a
    /// `[replica_count]` vector of per-replica losses under replica
    /// execution (reduced by the engine). Implementations must accept the
    /// feature tensor in any float dtype.
    fn forward_loss(&self, batch: &EncodedBatch, train: bool) -> Result<Tensor, FinetuneError>;

    /// Frame logits `[batch, frames, vocab]` plus the per-row count of
    /// frames backed by real (unpadded) input.
    fn logits(&self, batch: &EncodedBatch) -> Result<(Tensor, Vec<usize>), FinetuneError>;

    /// Variables the optimizer may update, honoring any freezes applied.
    fn trainable_vars(&self) -> Vec<Var>;

    fn freeze_feature_extractor(&mut self);

    fn freeze_base_model(&mut self);

    fn save_checkpoint(&self, dir: &Path) -> Result<(), FinetuneError>;
}

/// Third-party mixed-precision seam: the backend owns the loss scale and
/// the scaled-loss transform; gradients are unscaled by the strategy after
/// backward.
pub trait MixedPrecisionBackend: Send {
    fn scale_loss(&self, loss: &Tensor) -> Result<Tensor, FinetuneError>;
    fn loss_scale(&self) -> f64;
}

/// External distributed-training seam: when active, the whole backward
/// pass is delegated here.
pub trait DistributedBackend: Send {
    fn backward(&self, loss: &Tensor) -> Result<GradStore, FinetuneError>;
}
