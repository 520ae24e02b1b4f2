//! Fixed-length greedy decoding.

use lowmem_core::{LowmemError, Result, Tensor};

/// An autoregressive model driven one step at a time.
pub trait CausalLm {
    /// Clear any recurrent state (caches) before a new sequence.
    fn reset(&mut self);

    /// Run the model over `token_ids` at `position_ids` and return the
    /// next-token scores of the last position, shaped `[vocab]` or `[1, vocab]`.
    fn forward(&mut self, token_ids: &[u32], position_ids: &[u32]) -> Result<Tensor>;
}

/// Index of the largest finite-or-infinite score. NaN never wins; ties go
/// to the lowest index.
pub fn argmax(scores: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in scores.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

/// Greedy decoding to exactly `max_length` tokens.
///
/// The EOS score is forced to `-inf` before every pick, so the output never
/// stops early; `eos_token_id` only names the token to suppress. Returns the
/// prompt followed by the generated tokens. When `max_length` does not exceed
/// the prompt length the prompt is returned as is.
pub fn greedy_search<M: CausalLm + ?Sized>(
    model: &mut M,
    input_ids: &[u32],
    max_length: usize,
    eos_token_id: u32,
) -> Result<Vec<u32>> {
    if input_ids.is_empty() {
        return Err(LowmemError::InvalidArgument(
            "greedy_search needs a non-empty prompt".into(),
        ));
    }

    let prompt_len = input_ids.len();
    let mut tokens = input_ids.to_vec();
    model.reset();
    let positions: Vec<u32> = (0..prompt_len as u32).collect();
    let mut scores = last_scores(&model.forward(input_ids, &positions)?)?;

    for cur_len in prompt_len..max_length {
        if let Some(s) = scores.get_mut(eos_token_id as usize) {
            *s = f32::NEG_INFINITY;
        }
        let next = argmax(&scores).ok_or_else(|| {
            LowmemError::InvalidArgument("model returned no usable scores".into())
        })? as u32;
        tokens.push(next);
        tracing::trace!(step = cur_len, token = next, "greedy step");

        scores = last_scores(&model.forward(&[next], &[cur_len as u32])?)?;
    }

    Ok(tokens)
}

/// The last row of a score tensor, as f32.
fn last_scores(scores: &Tensor) -> Result<Vec<f32>> {
    let vocab = scores.shape().last_dim();
    let all = scores.to_f32_vec();
    if scores.ndim() == 0 || vocab == 0 || all.len() < vocab {
        return Err(LowmemError::InvalidArgument(format!(
            "expected next-token scores, got shape {}",
            scores.shape()
        )));
    }
    Ok(all[all.len() - vocab..].to_vec())
}
