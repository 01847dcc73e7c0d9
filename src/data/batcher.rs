use super::dataset::QaItem;
use burn::{data::dataloader::batcher::Batcher, prelude::*, tensor::TensorData};

/// Collates tokenized prompts into causal-LM batches. No tokens are masked;
/// targets are the labels shifted one position to the left.
#[derive(Clone, new)]
pub struct QaBatcher<B: Backend> {
    device: B::Device,
}

#[derive(Debug, Clone, new)]
pub struct QaBatch<B: Backend> {
    pub tokens_inputs: Tensor<B, 2, Int>, // [batch_size, seq_len - 1]
    pub targets: Tensor<B, 2, Int>,       // [batch_size, seq_len - 1]
    pub mask_pad: Tensor<B, 2, Bool>,     // true where padded
}

impl<B: Backend> QaBatcher<B> {
    fn stack<T: Copy + Into<i64>>(
        &self,
        rows: Vec<&[T]>,
        seq_length: usize,
    ) -> Tensor<B, 2, Int> {
        let batch_size = rows.len();
        let data: Vec<i64> = rows
            .into_iter()
            .flat_map(|row| row.iter().map(|value| (*value).into()))
            .collect();

        Tensor::from_data(TensorData::new(data, [batch_size, seq_length]), &self.device)
    }
}

impl<B: Backend> Batcher<QaItem, QaBatch<B>> for QaBatcher<B> {
    fn batch(&self, items: Vec<QaItem>) -> QaBatch<B> {
        let batch_size = items.len();
        let seq_length = items.first().map_or(0, |item| item.input_ids.len());
        debug_assert!(items.iter().all(|item| item.input_ids.len() == seq_length));

        let input_ids: Vec<Vec<i64>> = items
            .iter()
            .map(|item| item.input_ids.iter().map(|id| *id as i64).collect())
            .collect();
        let labels: Vec<Vec<i64>> = items
            .iter()
            .map(|item| item.labels.iter().map(|id| *id as i64).collect())
            .collect();

        let input_ids = self.stack(input_ids.iter().map(Vec::as_slice).collect(), seq_length);
        let labels = self.stack(labels.iter().map(Vec::as_slice).collect(), seq_length);
        let attention = self.stack(
            items.iter().map(|item| item.attention_mask.as_slice()).collect(),
            seq_length,
        );

        let tokens_inputs = input_ids.slice([0..batch_size, 0..seq_length - 1]);
        let targets = labels.slice([0..batch_size, 1..seq_length]);
        let mask_pad = attention
            .slice([0..batch_size, 0..seq_length - 1])
            .equal_elem(0);

        QaBatch::new(tokens_inputs, targets, mask_pad)
    }
}
