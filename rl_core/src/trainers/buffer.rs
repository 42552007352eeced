// Buffer - keyed experience columns consumed by the optimizers
use std::collections::BTreeMap;
use tch::{Device, Kind, Tensor};

use crate::error::{Result, TrainerError};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BufferKey {
    /// Per-stream rewards, keyed by reward-signal name.
    Rewards(String),
    Masks,
    Done,
    ActionMask,
    Memory,
    CriticMemory,
    ContinuousAction,
    DiscreteAction,
    Obs(usize),
    NextObs(usize),
}

/// Column store of experiences. Each row is one step; all rows of a column
/// share the same width.
#[derive(Debug, Clone, Default)]
pub struct AgentBuffer {
    fields: BTreeMap<BufferKey, Vec<Vec<f32>>>,
}

impl AgentBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, key: BufferKey, row: Vec<f32>) {
        self.fields.entry(key).or_default().push(row);
    }

    pub fn append_scalar(&mut self, key: BufferKey, value: f32) {
        self.append(key, vec![value]);
    }

    pub fn contains(&self, key: &BufferKey) -> bool {
        self.fields.contains_key(key)
    }

    pub fn column(&self, key: &BufferKey) -> Result<&[Vec<f32>]> {
        self.fields
            .get(key)
            .map(|rows| rows.as_slice())
            .ok_or_else(|| TrainerError::MissingColumn(key.clone()))
    }

    /// Length of the longest column.
    pub fn num_experiences(&self) -> usize {
        self.fields.values().map(|rows| rows.len()).max().unwrap_or(0)
    }

    fn flatten(key: &BufferKey, rows: &[&Vec<f32>]) -> Result<(Vec<f32>, usize)> {
        let width = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut flat = Vec::with_capacity(rows.len() * width);
        for row in rows {
            if row.len() != width {
                return Err(TrainerError::ColumnShape {
                    key: key.clone(),
                    expected: width,
                    found: row.len(),
                });
            }
            flat.extend_from_slice(row);
        }
        Ok((flat, width))
    }

    /// Column as a `(rows, width)` float tensor.
    pub fn to_tensor(&self, key: &BufferKey, device: Device) -> Result<Tensor> {
        let rows: Vec<&Vec<f32>> = self.column(key)?.iter().collect();
        self.rows_to_tensor(key, &rows, device)
    }

    /// Column of width-one rows as a `(rows,)` tensor.
    pub fn to_scalar_tensor(&self, key: &BufferKey, device: Device) -> Result<Tensor> {
        let tensor = self.to_tensor(key, device)?;
        let width = tensor.size().get(1).copied().unwrap_or(1);
        if width != 1 {
            return Err(TrainerError::ColumnShape {
                key: key.clone(),
                expected: 1,
                found: width as usize,
            });
        }
        Ok(tensor.squeeze_dim(1))
    }

    /// Every `step`-th row of a column, stacked into `(rows / step, width)`.
    /// Returns `None` when the column is absent or empty.
    pub fn strided_tensor(&self, key: &BufferKey, step: usize, device: Device) -> Result<Option<Tensor>> {
        let rows = match self.fields.get(key) {
            Some(rows) if !rows.is_empty() => rows,
            _ => return Ok(None),
        };
        let picked: Vec<&Vec<f32>> = rows.iter().step_by(step.max(1)).collect();
        self.rows_to_tensor(key, &picked, device).map(Some)
    }

    fn rows_to_tensor(&self, key: &BufferKey, rows: &[&Vec<f32>], device: Device) -> Result<Tensor> {
        let (flat, width) = Self::flatten(key, rows)?;
        Ok(Tensor::from_slice(&flat)
            .to_kind(Kind::Float)
            .to_device(device)
            .reshape([rows.len() as i64, width as i64]))
    }

    /// Samples `batch_size` experiences as whole sequences of `sequence_length`
    /// steps, without replacement.
    pub fn sample_mini_batch(&self, batch_size: usize, sequence_length: usize) -> AgentBuffer {
        use rand::seq::SliceRandom;
        let mut rng = rand::thread_rng();

        let sequence_length = sequence_length.max(1);
        let num_sequences = self.num_experiences() / sequence_length;
        let wanted = (batch_size / sequence_length).min(num_sequences);
        let starts: Vec<usize> = (0..num_sequences)
            .collect::<Vec<_>>()
            .choose_multiple(&mut rng, wanted)
            .map(|s| s * sequence_length)
            .collect();

        let mut sampled = AgentBuffer::new();
        for (key, rows) in &self.fields {
            let column = sampled.fields.entry(key.clone()).or_default();
            for &start in &starts {
                let end = (start + sequence_length).min(rows.len());
                if start < end {
                    column.extend(rows[start..end].iter().cloned());
                }
            }
        }
        sampled
    }
}

/// Name of the reward column for a reward stream.
pub fn rewards_key(stream: &str) -> BufferKey {
    BufferKey::Rewards(stream.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(n: usize) -> AgentBuffer {
        let mut buffer = AgentBuffer::new();
        for i in 0..n {
            buffer.append(BufferKey::Obs(0), vec![i as f32, -(i as f32)]);
            buffer.append_scalar(BufferKey::Done, 0.0);
            buffer.append_scalar(rewards_key("extrinsic"), i as f32);
        }
        buffer
    }

    #[test]
    fn test_to_tensor_shapes() {
        let buffer = filled(5);
        let obs = buffer.to_tensor(&BufferKey::Obs(0), Device::Cpu).unwrap();
        assert_eq!(obs.size(), vec![5, 2]);
        let rewards = buffer
            .to_scalar_tensor(&rewards_key("extrinsic"), Device::Cpu)
            .unwrap();
        assert_eq!(rewards.size(), vec![5]);
        assert_eq!(rewards.double_value(&[3]), 3.0);
    }

    #[test]
    fn test_missing_and_ragged_columns() {
        let mut buffer = filled(2);
        assert!(matches!(
            buffer.to_tensor(&BufferKey::Masks, Device::Cpu),
            Err(TrainerError::MissingColumn(BufferKey::Masks))
        ));
        buffer.append(BufferKey::Obs(0), vec![1.0]);
        assert!(matches!(
            buffer.to_tensor(&BufferKey::Obs(0), Device::Cpu),
            Err(TrainerError::ColumnShape { expected: 2, found: 1, .. })
        ));
    }

    #[test]
    fn test_strided_rows() {
        let buffer = filled(6);
        let picked = buffer
            .strided_tensor(&BufferKey::Obs(0), 3, Device::Cpu)
            .unwrap()
            .unwrap();
        assert_eq!(picked.size(), vec![2, 2]);
        assert_eq!(picked.double_value(&[1, 0]), 3.0);
        assert!(buffer
            .strided_tensor(&BufferKey::Memory, 3, Device::Cpu)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_sample_keeps_sequences_contiguous() {
        let buffer = filled(12);
        let batch = buffer.sample_mini_batch(8, 4);
        assert_eq!(batch.num_experiences(), 8);
        let obs = batch.column(&BufferKey::Obs(0)).unwrap();
        for seq in obs.chunks(4) {
            assert_eq!(seq[0][0] as usize % 4, 0);
            for pair in seq.windows(2) {
                assert_eq!(pair[1][0], pair[0][0] + 1.0);
            }
        }
    }
}
