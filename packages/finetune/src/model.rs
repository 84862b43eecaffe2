use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    autograd::{Act, Param, Rng, Tape},
    checkpoint::{Checkpoint, CheckpointError, StateDict},
};

/// Minimal interface the dual-encoder wrapper needs from its parts.
pub trait Module {
    fn forward(&self, tape: &mut Tape, x: Act) -> Act;

    /// Parameter names paired with their tape indices, in registration order.
    fn named_params(&self) -> Vec<(String, usize)>;

    fn set_training(&mut self, _training: bool) {}
}

#[derive(Debug, Clone)]
pub struct Linear {
    name: String,
    weight: usize,
    bias: usize,
}

impl Linear {
    pub fn new(
        tape: &mut Tape,
        rng: &mut Rng,
        name: impl Into<String>,
        in_dim: usize,
        out_dim: usize,
    ) -> Self {
        let std = (1.0 / in_dim as f64).sqrt();
        let weight = tape.add_param(Param::matrix(rng, out_dim, in_dim, std));
        let bias = tape.add_param(Param::zeros(1, out_dim));
        Self {
            name: name.into(),
            weight,
            bias,
        }
    }
}

impl Module for Linear {
    fn forward(&self, tape: &mut Tape, x: Act) -> Act {
        let y = tape.matvec(self.weight, x);
        let b = tape.embed_row(self.bias, 0);
        tape.vec_add(y, b)
    }

    fn named_params(&self) -> Vec<(String, usize)> {
        vec![
            (format!("{}.weight", self.name), self.weight),
            (format!("{}.bias", self.name), self.bias),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub input_dim: usize,
    pub hidden_dim: usize,
    pub feature_dim: usize,
}

impl EncoderConfig {
    pub fn for_image(size: usize, hidden_dim: usize, feature_dim: usize) -> Self {
        Self {
            input_dim: 3 * size * size,
            hidden_dim,
            feature_dim,
        }
    }
}

/// Two-layer perceptron over flattened CHW pixels. Outputs are rectified, like
/// pooled convolutional features.
#[derive(Debug, Clone)]
pub struct MlpEncoder {
    layers: Vec<Linear>,
}

impl MlpEncoder {
    pub fn new(tape: &mut Tape, rng: &mut Rng, config: EncoderConfig) -> Self {
        let layers = vec![
            Linear::new(tape, rng, "fc1", config.input_dim, config.hidden_dim),
            Linear::new(tape, rng, "fc2", config.hidden_dim, config.feature_dim),
        ];
        Self { layers }
    }
}

impl Module for MlpEncoder {
    fn forward(&self, tape: &mut Tape, x: Act) -> Act {
        self.layers.iter().fold(x, |h, layer| {
            let z = layer.forward(tape, h);
            tape.relu(z)
        })
    }

    fn named_params(&self) -> Vec<(String, usize)> {
        self.layers.iter().flat_map(Linear::named_params).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadConfig {
    pub feature_dim: usize,
    pub projection_dim: usize,
}

/// Linear → ReLU → Linear projection used only for the contrastive objective.
#[derive(Debug, Clone)]
pub struct ProjectionHead {
    hidden: Linear,
    output: Linear,
}

impl ProjectionHead {
    pub fn new(tape: &mut Tape, rng: &mut Rng, config: HeadConfig) -> Self {
        let hidden = Linear::new(tape, rng, "hidden", config.feature_dim, config.feature_dim);
        let output = Linear::new(tape, rng, "output", config.feature_dim, config.projection_dim);
        Self { hidden, output }
    }
}

impl Module for ProjectionHead {
    fn forward(&self, tape: &mut Tape, x: Act) -> Act {
        let h = self.hidden.forward(tape, x);
        let h = tape.relu(h);
        self.output.forward(tape, h)
    }

    fn named_params(&self) -> Vec<(String, usize)> {
        let mut named = self.hidden.named_params();
        named.extend(self.output.named_params());
        named
    }
}

/// Encoder plus projection head. The single encoder is applied to both views.
#[derive(Debug, Clone)]
pub struct DualEncoderModel<E, H> {
    encoder: E,
    head: H,
}

impl<E: Module, H: Module> DualEncoderModel<E, H> {
    pub fn new(encoder: E, head: H) -> Self {
        Self { encoder, head }
    }

    pub fn into_parts(self) -> (E, H) {
        (self.encoder, self.head)
    }

    pub fn set_training(&mut self, training: bool) {
        self.encoder.set_training(training);
        self.head.set_training(training);
    }

    #[cfg(test)]
    fn param_indices(&self) -> Vec<usize> {
        self.encoder
            .named_params()
            .into_iter()
            .chain(self.head.named_params())
            .map(|(_, idx)| idx)
            .collect()
    }

    fn embed(&self, tape: &mut Tape, view: &[f32]) -> Act {
        let x = tape.constant(view.iter().map(|v| f64::from(*v)).collect());
        let h = self.encoder.forward(tape, x);
        self.head.forward(tape, h)
    }

    /// Projects both augmented batches; returns one activation per sample.
    pub fn forward(
        &self,
        tape: &mut Tape,
        x1: &[Vec<f32>],
        x2: &[Vec<f32>],
    ) -> (Vec<Act>, Vec<Act>) {
        let z1 = x1.iter().map(|view| self.embed(tape, view)).collect();
        let z2 = x2.iter().map(|view| self.embed(tape, view)).collect();
        (z1, z2)
    }

    pub fn checkpoint(&self, tape: &Tape) -> Checkpoint {
        Checkpoint {
            encoder: StateDict::capture(&self.encoder.named_params(), tape),
            head: StateDict::capture(&self.head.named_params(), tape),
        }
    }

    /// Writes encoder and head state separately; an existing file is replaced.
    pub fn save(&self, tape: &Tape, path: &Path) -> Result<(), CheckpointError> {
        self.checkpoint(tape).save(path)
    }

    /// Loads weights into caller-built modules. The modules must already have
    /// the architecture the checkpoint was saved from; their parameters live
    /// on `tape`, which is where the weights are placed.
    pub fn load(
        path: &Path,
        encoder: E,
        head: H,
        tape: &mut Tape,
    ) -> Result<Self, CheckpointError> {
        let checkpoint = Checkpoint::load(path)?;
        checkpoint
            .encoder
            .apply("encoder", &encoder.named_params(), tape)?;
        checkpoint.head.apply("head", &head.named_params(), tape)?;
        Ok(Self::new(encoder, head))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny(tape: &mut Tape, seed: u64) -> (MlpEncoder, ProjectionHead) {
        let mut rng = Rng::new(seed);
        let encoder = MlpEncoder::new(
            tape,
            &mut rng,
            EncoderConfig {
                input_dim: 6,
                hidden_dim: 5,
                feature_dim: 4,
            },
        );
        let head = ProjectionHead::new(
            tape,
            &mut rng,
            HeadConfig {
                feature_dim: 4,
                projection_dim: 3,
            },
        );
        (encoder, head)
    }

    #[test]
    fn forward_projects_each_view() {
        let mut tape = Tape::new();
        let (encoder, head) = tiny(&mut tape, 1);
        let model = DualEncoderModel::new(encoder, head);
        let x1 = vec![vec![0.1_f32; 6], vec![0.5; 6]];
        let x2 = vec![vec![0.2_f32; 6], vec![0.9; 6]];

        let (z1, z2) = model.forward(&mut tape, &x1, &x2);
        assert_eq!(z1.len(), 2);
        assert_eq!(z2.len(), 2);
        assert_eq!(tape.value(z1[0]).len(), 3);
    }

    #[test]
    fn identical_views_share_the_encoder() {
        let mut tape = Tape::new();
        let (encoder, head) = tiny(&mut tape, 2);
        let model = DualEncoderModel::new(encoder, head);
        let x = vec![vec![0.3_f32, 0.1, 0.7, 0.2, 0.9, 0.4]];

        let (z1, z2) = model.forward(&mut tape, &x, &x);
        assert_eq!(tape.value(z1[0]), tape.value(z2[0]));
    }

    #[test]
    fn save_then_load_reconstructs_identical_parameters() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("epoch_1.pth");

        let mut tape = Tape::new();
        let (encoder, head) = tiny(&mut tape, 3);
        let model = DualEncoderModel::new(encoder, head);
        model.save(&tape, &path).expect("save");

        let mut fresh = Tape::new();
        let (encoder, head) = tiny(&mut fresh, 99);
        let loaded = DualEncoderModel::load(&path, encoder, head, &mut fresh).expect("load");

        for (a, b) in model.param_indices().iter().zip(loaded.param_indices()) {
            assert_eq!(tape.params()[*a].data, fresh.params()[b].data);
        }
    }

    #[test]
    fn load_into_wrong_architecture_is_a_state_mismatch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("model.pth");
        let mut tape = Tape::new();
        let (encoder, head) = tiny(&mut tape, 3);
        DualEncoderModel::new(encoder, head)
            .save(&tape, &path)
            .expect("save");

        let mut other = Tape::new();
        let mut rng = Rng::new(4);
        let encoder = MlpEncoder::new(
            &mut other,
            &mut rng,
            EncoderConfig {
                input_dim: 6,
                hidden_dim: 8,
                feature_dim: 4,
            },
        );
        let head = ProjectionHead::new(
            &mut other,
            &mut rng,
            HeadConfig {
                feature_dim: 4,
                projection_dim: 3,
            },
        );

        let err = DualEncoderModel::load(&path, encoder, head, &mut other).expect_err("mismatch");
        assert!(matches!(err, CheckpointError::StateMismatch { .. }));
    }
}
