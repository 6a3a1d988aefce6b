use burn::prelude::*;

use crate::ai::agent::masked_mean;

/// PPO loss for the RLHF agent: clipped surrogate on response tokens, value
/// regression, entropy bonus and a prompt log-likelihood (pretraining) bonus.
#[derive(Debug, Clone)]
pub struct AgentLoss {
    pub clip_epsilon: f32,
    pub value_coeff: f32,
    pub entropy_coeff: f32,
    /// Weight of the prompt log-likelihood term (the objective's `gamma`).
    pub ptx_coeff: f32,
}

impl Default for AgentLoss {
    fn default() -> Self {
        AgentLoss {
            clip_epsilon: 0.2,
            value_coeff: 0.5,
            entropy_coeff: 0.01,
            ptx_coeff: 0.0,
        }
    }
}

/// Per-token inputs, all [batch, response_len] unless noted.
#[derive(Debug, Clone)]
pub struct LossInput<B: Backend> {
    pub log_probs: Tensor<B, 2>,
    pub old_log_probs: Tensor<B, 2>,
    pub advantages: Tensor<B, 2>,
    pub returns: Tensor<B, 2>,
    pub values: Tensor<B, 2>,
    pub entropy: Tensor<B, 2>,
    pub response_mask: Tensor<B, 2>,
    /// [1]
    pub prompt_log_likelihood: Tensor<B, 1>,
}

/// Total loss plus its parts; every field is [1].
#[derive(Debug, Clone)]
pub struct LossOutput<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub policy_loss: Tensor<B, 1>,
    pub value_loss: Tensor<B, 1>,
    pub entropy: Tensor<B, 1>,
    pub approx_kl: Tensor<B, 1>,
    pub clip_fraction: Tensor<B, 1>,
}

impl AgentLoss {
    pub fn forward<B: Backend>(&self, input: LossInput<B>) -> LossOutput<B> {
        let mask = input.response_mask;

        // r = exp(log_pi_new - log_pi_old)
        let log_ratio = input.log_probs - input.old_log_probs;
        let ratio = log_ratio.clone().exp();

        let surr1 = ratio.clone() * input.advantages.clone();
        let surr2 = ratio
            .clone()
            .clamp(1.0 - self.clip_epsilon, 1.0 + self.clip_epsilon)
            * input.advantages;

        // min(a, b) = (a + b - |a - b|) / 2
        let abs_diff = (surr1.clone() - surr2.clone()).abs();
        let policy_objective = (surr1 + surr2 - abs_diff) / 2.0;
        let policy_loss = -masked_mean(policy_objective, mask.clone());

        let value_diff = input.values - input.returns;
        let value_loss = masked_mean(value_diff.clone() * value_diff, mask.clone());

        let entropy = masked_mean(input.entropy, mask.clone());

        let loss = policy_loss.clone() + value_loss.clone().mul_scalar(self.value_coeff)
            - entropy.clone().mul_scalar(self.entropy_coeff)
            - input.prompt_log_likelihood.mul_scalar(self.ptx_coeff);

        // k3 estimator: E[(r - 1) - log r]
        let approx_kl = masked_mean(
            (ratio.clone().sub_scalar(1.0) - log_ratio).detach(),
            mask.clone(),
        );
        let clip_fraction = masked_mean(
            ratio
                .sub_scalar(1.0)
                .abs()
                .greater_elem(self.clip_epsilon)
                .float()
                .detach(),
            mask,
        );

        LossOutput {
            loss,
            policy_loss,
            value_loss,
            entropy,
            approx_kl,
            clip_fraction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    fn t2(data: &[f32]) -> Tensor<TestBackend, 2> {
        Tensor::<TestBackend, 1>::from_data(TensorData::from(data), &Default::default())
            .reshape([1, data.len()])
    }

    fn scalar(t: Tensor<TestBackend, 1>) -> f32 {
        t.into_data().to_vec::<f32>().unwrap()[0]
    }

    fn input(log_probs: &[f32], old: &[f32], adv: &[f32], mask: &[f32]) -> LossInput<TestBackend> {
        LossInput {
            log_probs: t2(log_probs),
            old_log_probs: t2(old),
            advantages: t2(adv),
            returns: t2(&vec![0.0; log_probs.len()]),
            values: t2(&vec![0.0; log_probs.len()]),
            entropy: t2(&vec![0.0; log_probs.len()]),
            response_mask: t2(mask),
            prompt_log_likelihood: Tensor::zeros([1], &Default::default()),
        }
    }

    #[test]
    fn test_unchanged_policy_gives_negative_mean_advantage() {
        let loss = AgentLoss::default();
        let out = loss.forward(input(&[-1.0, -2.0, -3.0], &[-1.0, -2.0, -3.0], &[1.0, 3.0, 100.0], &[1.0, 1.0, 0.0]));

        assert!((scalar(out.policy_loss) + 2.0).abs() < 1e-5);
        assert!(scalar(out.approx_kl).abs() < 1e-6);
        assert!(scalar(out.clip_fraction).abs() < 1e-6);
    }

    #[test]
    fn test_ratio_is_clipped_for_positive_advantage() {
        let loss = AgentLoss {
            clip_epsilon: 0.2,
            ..Default::default()
        };
        // ratio = e^1 ~ 2.718, clipped to 1.2
        let out = loss.forward(input(&[0.0], &[-1.0], &[2.0], &[1.0]));
        assert!((scalar(out.policy_loss) + 2.4).abs() < 1e-4);
        assert!((scalar(out.clip_fraction) - 1.0).abs() < 1e-6);
        assert!(scalar(out.approx_kl) > 0.0);
    }

    #[test]
    fn test_total_combines_parts() {
        let loss = AgentLoss {
            clip_epsilon: 0.2,
            value_coeff: 0.5,
            entropy_coeff: 0.1,
            ptx_coeff: 2.0,
        };
        let mut inp = input(&[-1.0, -1.0], &[-1.0, -1.0], &[1.0, 1.0], &[1.0, 1.0]);
        inp.values = t2(&[1.0, 1.0]);
        inp.returns = t2(&[0.0, 0.0]);
        inp.entropy = t2(&[0.5, 0.5]);
        inp.prompt_log_likelihood = Tensor::from_data(TensorData::from([-3.0f32].as_slice()), &Default::default());

        let out = loss.forward(inp);
        // policy -1, value 1, entropy 0.5, ptx -3
        let expected = -1.0 + 0.5 * 1.0 - 0.1 * 0.5 - 2.0 * -3.0;
        assert!((scalar(out.loss) - expected).abs() < 1e-5);
        assert!((scalar(out.value_loss) - 1.0).abs() < 1e-6);
        assert!((scalar(out.entropy) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_gradient_reaches_log_probs() {
        type Ad = Autodiff<TestBackend>;
        let device = Default::default();
        let row = |data: &[f32]| {
            Tensor::<Ad, 1>::from_data(TensorData::from(data), &device).reshape([1, data.len()])
        };

        let log_probs = row(&[-1.0, -2.0]).require_grad();
        let out = AgentLoss::default().forward(LossInput {
            log_probs: log_probs.clone(),
            old_log_probs: row(&[-1.0, -2.0]),
            advantages: row(&[1.0, -1.0]),
            returns: row(&[0.0, 0.0]),
            values: row(&[0.0, 0.0]),
            entropy: row(&[0.0, 0.0]),
            response_mask: row(&[1.0, 1.0]),
            prompt_log_likelihood: Tensor::zeros([1], &device),
        });

        let grads = out.loss.backward();
        let grad: Vec<f32> = log_probs.grad(&grads).unwrap().into_data().to_vec().unwrap();
        // d(-mean(r * A))/d log_pi = -A / n at r = 1
        assert!((grad[0] + 0.5).abs() < 1e-5);
        assert!((grad[1] - 0.5).abs() < 1e-5);
    }
}
