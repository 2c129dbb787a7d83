//! Token sampling implementations.

use forneus_core::GenerationConfig;

/// Token sampler for text generation.
pub struct Sampler {
    config: GenerationConfig,
    rng: fastrand::Rng,
}

impl Sampler {
    /// Creates a new sampler with the given settings.
    #[must_use]
    pub fn new(config: GenerationConfig) -> Self {
        let rng = config
            .seed
            .map_or_else(fastrand::Rng::new, fastrand::Rng::with_seed);

        Self { config, rng }
    }

    /// Samples the next token from the logits of the last position.
    ///
    /// `previous` holds the tokens seen so far and feeds the repetition penalty.
    #[must_use]
    pub fn sample(&mut self, logits: &[f32], previous: &[u32]) -> u32 {
        let mut logits = logits.to_vec();
        #[allow(clippy::float_cmp)]
        if self.config.repetition_penalty != 1.0 {
            Self::apply_repetition_penalty(&mut logits, previous, self.config.repetition_penalty);
        }

        if !self.config.do_sample || self.config.temperature <= 0.0 {
            return Self::argmax(&logits);
        }

        let scaled: Vec<f32> = logits
            .iter()
            .map(|&l| l / self.config.temperature)
            .collect();

        let filtered = if self.config.top_k > 0 {
            Self::top_k_filter(&scaled, self.config.top_k as usize)
        } else {
            scaled
        };

        let filtered = if self.config.top_p < 1.0 {
            Self::top_p_filter(&filtered, self.config.top_p)
        } else {
            filtered
        };

        self.categorical_sample(&filtered)
    }

    /// Divides positive logits and multiplies negative logits of seen tokens.
    fn apply_repetition_penalty(logits: &mut [f32], previous: &[u32], penalty: f32) {
        for &id in previous {
            if let Some(l) = logits.get_mut(id as usize) {
                *l = if *l > 0.0 { *l / penalty } else { *l * penalty };
            }
        }
    }

    /// Returns the index of the maximum value.
    #[allow(clippy::cast_possible_truncation)]
    fn argmax(logits: &[f32]) -> u32 {
        logits
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map_or(0, |(i, _)| i as u32)
    }

    /// Applies top-k filtering.
    fn top_k_filter(logits: &[f32], k: usize) -> Vec<f32> {
        let mut indexed: Vec<(usize, f32)> = logits.iter().copied().enumerate().collect();
        indexed.sort_by(|(_, a), (_, b)| b.total_cmp(a));

        let mut result = vec![f32::NEG_INFINITY; logits.len()];
        for (i, v) in indexed.into_iter().take(k) {
            result[i] = v;
        }
        result
    }

    /// Applies top-p (nucleus) filtering.
    fn top_p_filter(logits: &[f32], p: f32) -> Vec<f32> {
        let probs = Self::softmax(logits);
        let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
        indexed.sort_by(|(_, a), (_, b)| b.total_cmp(a));

        let mut cumsum = 0.0;
        let mut result = vec![f32::NEG_INFINITY; logits.len()];

        for (i, prob) in indexed {
            if cumsum < p {
                result[i] = logits[i];
                cumsum += prob;
            }
        }

        result
    }

    /// Computes softmax probabilities.
    fn softmax(logits: &[f32]) -> Vec<f32> {
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exp: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
        let sum: f32 = exp.iter().sum();
        exp.iter().map(|&e| e / sum).collect()
    }

    /// Samples from a categorical distribution.
    #[allow(clippy::cast_possible_truncation)]
    fn categorical_sample(&mut self, logits: &[f32]) -> u32 {
        let probs = Self::softmax(logits);
        let r = self.rng.f32();

        let mut cumsum = 0.0;
        for (i, &p) in probs.iter().enumerate() {
            cumsum += p;
            if r < cumsum {
                return i as u32;
            }
        }

        probs.len().saturating_sub(1) as u32
    }

    /// Returns the generation settings.
    #[must_use]
    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greedy_sampling() {
        let mut sampler = Sampler::new(GenerationConfig::default());
        let logits = vec![1.0, 5.0, 2.0, 0.5];
        assert_eq!(sampler.sample(&logits, &[]), 1);
    }

    #[test]
    fn test_deterministic_with_seed() {
        let config = GenerationConfig::default()
            .with_do_sample(true)
            .with_temperature(0.7)
            .with_seed(42);
        let mut sampler1 = Sampler::new(config.clone());
        let mut sampler2 = Sampler::new(config);

        let logits = vec![1.0, 1.0, 1.0, 1.0];
        for _ in 0..8 {
            assert_eq!(sampler1.sample(&logits, &[]), sampler2.sample(&logits, &[]));
        }
    }

    #[test]
    fn test_top_k_one_is_greedy() {
        let config = GenerationConfig::default()
            .with_do_sample(true)
            .with_top_k(1)
            .with_seed(7);
        let mut sampler = Sampler::new(config);
        for _ in 0..16 {
            assert_eq!(sampler.sample(&[0.1, 0.2, 3.0, 0.3], &[]), 2);
        }
    }

    #[test]
    fn test_repetition_penalty_demotes_seen_tokens() {
        let config = GenerationConfig {
            repetition_penalty: 4.0,
            ..GenerationConfig::default()
        };
        let mut sampler = Sampler::new(config);
        assert_eq!(sampler.sample(&[2.0, 1.0], &[0]), 1);
    }
}
