use burn::prelude::{Backend, ElementConversion};
use burn::train::metric::{Adaptor, Metric, MetricEntry, MetricMetadata, Numeric};
use burn::train::ClassificationOutput;

/// Perplexity over the epoch: `exp` of the running mean of batch losses.
#[derive(Clone, Debug, Default)]
pub struct PerplexityMetric {
    total_loss: f64,
    count: usize,
}

#[derive(Debug)]
pub struct PerplexityInput {
    loss: f64,
}

impl PerplexityMetric {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Metric for PerplexityMetric {
    const NAME: &'static str = "Perplexity";
    type Input = PerplexityInput;

    fn update(&mut self, item: &Self::Input, _metadata: &MetricMetadata) -> MetricEntry {
        self.total_loss += item.loss;
        self.count += 1;

        let perplexity = self.value();
        MetricEntry::new(
            Self::NAME.to_string(),
            format!("{:.4}", perplexity),
            perplexity.to_string(),
        )
    }

    fn clear(&mut self) {
        self.total_loss = 0.0;
        self.count = 0;
    }
}

impl<B: Backend> Adaptor<PerplexityInput> for ClassificationOutput<B> {
    fn adapt(&self) -> PerplexityInput {
        let loss = self.loss.clone().into_scalar().elem::<f64>();
        PerplexityInput { loss }
    }
}

impl Numeric for PerplexityMetric {
    fn value(&self) -> f64 {
        if self.count == 0 {
            f64::INFINITY
        } else {
            (self.total_loss / self.count as f64).exp()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::data::dataloader::Progress;
    use burn::prelude::{Int, Tensor};
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_perplexity_is_exp_of_mean_loss() {
        let mut metric = PerplexityMetric::new();
        assert!(metric.value().is_infinite());

        let metadata = MetricMetadata {
            progress: Progress {
                items_processed: 0,
                items_total: 2,
            },
            epoch: 1,
            epoch_total: 1,
            iteration: 0,
            lr: None,
        };
        metric.update(&PerplexityInput { loss: 1.0 }, &metadata);
        metric.update(&PerplexityInput { loss: 3.0 }, &metadata);
        assert!((metric.value() - 2.0f64.exp()).abs() < 1e-9);

        metric.clear();
        assert!(metric.value().is_infinite());
    }

    #[test]
    fn test_adapt_classification_output() {
        let device = Default::default();
        let output = ClassificationOutput::<TestBackend> {
            loss: Tensor::from_data(TensorData::from([0.5f32]), &device),
            output: Tensor::zeros([1, 3], &device),
            targets: Tensor::<TestBackend, 1, Int>::zeros([1], &device),
        };

        let input =
            <ClassificationOutput<TestBackend> as Adaptor<PerplexityInput>>::adapt(&output);
        assert!((input.loss - 0.5).abs() < 1e-6);
    }
}
