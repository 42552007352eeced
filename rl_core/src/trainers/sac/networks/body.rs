// Network body - observation normalization, MLP encoder and optional LSTM
use tch::{nn, nn::Module, nn::RNN, Kind, Tensor};

use crate::trainers::sac::specs::ObservationSpec;
use crate::trainers::settings::NetworkSettings;

const NORMALIZATION_CLIP: f64 = 5.0;

/// Running mean/variance of one observation channel, stored as non-trainable
/// variables so they travel with checkpoints and soft updates.
#[derive(Debug)]
pub struct Normalizer {
    steps: Tensor,
    running_mean: Tensor,
    running_variance: Tensor,
}

impl Normalizer {
    pub fn new(path: &nn::Path, size: i64) -> Self {
        Self {
            steps: path.ones_no_train("normalization_steps", &[1]),
            running_mean: path.zeros_no_train("running_mean", &[size]),
            running_variance: path.ones_no_train("running_variance", &[size]),
        }
    }

    pub fn normalize(&self, inputs: &Tensor) -> Tensor {
        let std = (&self.running_variance / &self.steps).sqrt();
        ((inputs - &self.running_mean) / std).clamp(-NORMALIZATION_CLIP, NORMALIZATION_CLIP)
    }

    /// Batched Welford update from `(batch, size)` inputs.
    pub fn update(&self, inputs: &Tensor) {
        tch::no_grad(|| {
            let batch = inputs.size()[0] as f64;
            let total_steps = &self.steps + batch;
            let to_old_mean = inputs - &self.running_mean;
            let new_mean = &self.running_mean
                + (&to_old_mean / &total_steps).sum_dim_intlist(&[0i64][..], false, Kind::Float);
            let to_new_mean = inputs - &new_mean;
            let new_variance = &self.running_variance
                + (to_new_mean * to_old_mean).sum_dim_intlist(&[0i64][..], false, Kind::Float);

            self.running_mean.shallow_clone().copy_(&new_mean);
            self.running_variance.shallow_clone().copy_(&new_variance);
            self.steps.shallow_clone().copy_(&total_steps);
        });
    }

    pub fn copy_from(&self, other: &Normalizer) {
        tch::no_grad(|| {
            self.steps.shallow_clone().copy_(&other.steps);
            self.running_mean.shallow_clone().copy_(&other.running_mean);
            self.running_variance.shallow_clone().copy_(&other.running_variance);
        });
    }

    pub fn running_mean(&self) -> &Tensor {
        &self.running_mean
    }
}

/// Shared encoder used by the actor, the critics and the MEDE discriminator.
///
/// Observation channels are flattened, optionally normalized, concatenated
/// with an optional action tensor and passed through `num_layers` linear+swish
/// layers. With memory settings, an LSTM runs over `sequence_length` steps.
pub struct NetworkBody {
    normalizers: Vec<Option<Normalizer>>,
    layers: Vec<nn::Linear>,
    lstm: Option<nn::LSTM>,
    memory_size: i64,
    hidden_units: i64,
}

impl NetworkBody {
    pub fn new(
        path: &nn::Path,
        observation_specs: &[ObservationSpec],
        settings: &NetworkSettings,
        action_input_size: i64,
    ) -> Self {
        let normalizers = observation_specs
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                settings
                    .normalize
                    .then(|| Normalizer::new(&(path / format!("processor_{}", i)), spec.flat_size()))
            })
            .collect();

        let mut in_features =
            observation_specs.iter().map(|s| s.flat_size()).sum::<i64>() + action_input_size;
        let mut layers = Vec::with_capacity(settings.num_layers);
        for i in 0..settings.num_layers {
            layers.push(nn::linear(
                path / format!("encoder_{}", i),
                in_features,
                settings.hidden_units,
                Default::default(),
            ));
            in_features = settings.hidden_units;
        }

        let (lstm, memory_size) = match settings.memory {
            Some(memory) => {
                let config = nn::RNNConfig {
                    batch_first: true,
                    ..Default::default()
                };
                let lstm = nn::lstm(path / "lstm", in_features, memory.memory_size / 2, config);
                (Some(lstm), memory.memory_size)
            }
            None => (None, 0),
        };

        Self {
            normalizers,
            layers,
            lstm,
            memory_size,
            hidden_units: in_features,
        }
    }

    /// Width of the encoding produced by `forward`.
    pub fn output_size(&self) -> i64 {
        if self.lstm.is_some() {
            self.memory_size / 2
        } else {
            self.hidden_units
        }
    }

    pub fn memory_size(&self) -> i64 {
        self.memory_size
    }

    pub fn normalizer(&self, channel: usize) -> Option<&Normalizer> {
        self.normalizers.get(channel).and_then(|n| n.as_ref())
    }

    pub fn update_normalization(&self, inputs: &[Tensor]) {
        for (input, normalizer) in inputs.iter().zip(&self.normalizers) {
            if let Some(normalizer) = normalizer {
                normalizer.update(&input.flatten(1, -1));
            }
        }
    }

    /// Copies every channel's statistics from a body with the same channel layout.
    pub fn copy_normalization(&self, other: &NetworkBody) {
        for channel in 0..self.normalizers.len() {
            self.copy_channel_normalization(channel, other, channel);
        }
    }

    pub fn copy_channel_normalization(&self, channel: usize, other: &NetworkBody, other_channel: usize) {
        if let (Some(dest), Some(src)) = (self.normalizer(channel), other.normalizer(other_channel)) {
            dest.copy_from(src);
        }
    }

    pub fn forward(
        &self,
        inputs: &[Tensor],
        actions: Option<&Tensor>,
        memories: Option<&Tensor>,
        sequence_length: i64,
    ) -> (Tensor, Option<Tensor>) {
        let mut encoded: Vec<Tensor> = inputs
            .iter()
            .zip(&self.normalizers)
            .map(|(input, normalizer)| {
                let flat = input.flatten(1, -1);
                match normalizer {
                    Some(n) => n.normalize(&flat),
                    None => flat,
                }
            })
            .collect();
        if let Some(actions) = actions {
            encoded.push(actions.shallow_clone());
        }

        let mut hidden = Tensor::cat(&encoded, 1);
        for layer in &self.layers {
            hidden = layer.forward(&hidden).silu();
        }

        match &self.lstm {
            Some(lstm) => {
                let (hidden, new_memories) = self.run_lstm(lstm, &hidden, memories, sequence_length);
                (hidden, Some(new_memories))
            }
            None => (hidden, None),
        }
    }

    fn run_lstm(
        &self,
        lstm: &nn::LSTM,
        hidden: &Tensor,
        memories: Option<&Tensor>,
        sequence_length: i64,
    ) -> (Tensor, Tensor) {
        let batch = hidden.size()[0];
        let sequence_length = sequence_length.max(1);
        let num_sequences = batch / sequence_length;
        let half = self.memory_size / 2;

        let memories = match memories {
            Some(m) => m.shallow_clone(),
            None => Tensor::zeros(
                [1, num_sequences, self.memory_size],
                (Kind::Float, hidden.device()),
            ),
        };
        let state = nn::LSTMState((
            memories.narrow(2, 0, half).contiguous(),
            memories.narrow(2, half, half).contiguous(),
        ));

        let sequences = hidden.reshape([num_sequences, sequence_length, -1]);
        let (output, nn::LSTMState((h, c))) = lstm.seq_init(&sequences, &state);
        (output.reshape([batch, half]), Tensor::cat(&[h, c], 2))
    }
}
