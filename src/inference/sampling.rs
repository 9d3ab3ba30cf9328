//! Sampler chain over raw logits
//!
//! Temperature scaling, then nucleus (top-p) filtering, then a seeded draw
//! from what is left. The llama backend builds the same chain out of
//! llama.cpp samplers; this one serves engines that expose plain logits.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::backend::SamplerParams;

/// Stateful sampler. The RNG advances on every draw.
#[derive(Debug, Clone)]
pub struct SamplerChain {
    params: SamplerParams,
    rng: StdRng,
}

impl SamplerChain {
    pub fn new(params: SamplerParams) -> Self {
        Self {
            params,
            rng: StdRng::seed_from_u64(u64::from(params.seed)),
        }
    }

    /// Picks an index into `logits`. Returns `None` for an empty slice.
    ///
    /// A temperature of zero or below degrades to argmax.
    pub fn sample(&mut self, logits: &[f32]) -> Option<usize> {
        if logits.is_empty() {
            return None;
        }
        if self.params.temperature <= 0.0 {
            return argmax(logits);
        }

        let probs = softmax(logits, self.params.temperature);
        let nucleus = nucleus(&probs, self.params.top_p);

        let mass: f32 = nucleus.iter().map(|(_, p)| p).sum();
        let mut target = self.rng.gen::<f32>() * mass;
        for &(idx, p) in &nucleus {
            if target < p {
                return Some(idx);
            }
            target -= p;
        }
        nucleus.last().map(|&(idx, _)| idx)
    }
}

fn argmax(logits: &[f32]) -> Option<usize> {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
}

fn softmax(logits: &[f32], temperature: f32) -> Vec<f32> {
    let scaled: Vec<f32> = logits.iter().map(|&l| l / temperature).collect();
    let max = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scaled.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Smallest prefix of tokens, by descending probability, whose mass reaches `top_p`.
/// Always keeps at least one token.
fn nucleus(probs: &[f32], top_p: f32) -> Vec<(usize, f32)> {
    let mut ranked: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

    if top_p >= 1.0 {
        return ranked;
    }

    let mut cumulative = 0.0;
    let mut keep = 0;
    for (_, p) in &ranked {
        cumulative += p;
        keep += 1;
        if cumulative >= top_p {
            break;
        }
    }
    ranked.truncate(keep.max(1));
    ranked
}
