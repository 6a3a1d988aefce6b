//! Reward shaping and Generalized Advantage Estimation over generated
//! responses. All slices are row-major `[batch, response_len]`.

/// Per-token rewards: `-beta * (log pi - log pi_sft)` on every response
/// token, plus the sequence score on each row's last real token.
pub fn shaped_rewards(
    scores: &[f32],
    log_probs: &[f32],
    ref_log_probs: &[f32],
    mask: &[f32],
    response_len: usize,
    beta: f32,
) -> Vec<f32> {
    let mut rewards = vec![0.0f32; log_probs.len()];

    for (row, &score) in scores.iter().enumerate() {
        let base = row * response_len;
        let mut last = None;
        for i in base..base + response_len {
            if mask[i] == 0.0 {
                continue;
            }
            rewards[i] = -beta * (log_probs[i] - ref_log_probs[i]);
            last = Some(i);
        }
        if let Some(i) = last {
            rewards[i] += score;
        }
    }

    rewards
}

/// Compute GAE advantages and returns. Each row is one episode ending at its
/// last real token; masked positions get zero advantage and return.
/// Advantages are normalized over the real tokens of the whole batch.
pub fn compute_gae(
    rewards: &[f32],
    values: &[f32],
    mask: &[f32],
    response_len: usize,
    discount: f32,
    gae_lambda: f32,
) -> (Vec<f32>, Vec<f32>) {
    let n = rewards.len();
    let mut advantages = vec![0.0f32; n];
    let mut returns = vec![0.0f32; n];
    if response_len == 0 {
        return (advantages, returns);
    }

    for base in (0..n).step_by(response_len) {
        // Process backwards
        let mut gae = 0.0f32;
        let mut next_value = 0.0f32;
        for i in (base..base + response_len).rev() {
            if mask[i] == 0.0 {
                continue;
            }
            let delta = rewards[i] + discount * next_value - values[i];
            gae = delta + discount * gae_lambda * gae;

            advantages[i] = gae;
            returns[i] = gae + values[i];
            next_value = values[i];
        }
    }

    // Normalize advantages
    let valid: Vec<usize> = (0..n).filter(|&i| mask[i] != 0.0).collect();
    if valid.len() > 1 {
        let count = valid.len() as f32;
        let mean: f32 = valid.iter().map(|&i| advantages[i]).sum::<f32>() / count;
        let var: f32 = valid
            .iter()
            .map(|&i| (advantages[i] - mean).powi(2))
            .sum::<f32>()
            / count;
        let std = var.sqrt().max(1e-8);
        for &i in &valid {
            advantages[i] = (advantages[i] - mean) / std;
        }
    }

    (advantages, returns)
}
