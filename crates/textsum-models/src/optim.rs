//! AdamW optimizer and a linear learning-rate schedule.

/// Per-parameter-vector optimizer state.
#[derive(Debug, Clone, Default)]
pub struct AdamState {
    m: Vec<f32>,
    v: Vec<f32>,
}

/// AdamW with decoupled weight decay.
///
/// m = β1*m + (1-β1)*g
/// v = β2*v + (1-β2)*g²
/// θ = θ - lr * (m̂ / (√v̂ + ε) + wd * θ)
#[derive(Debug, Clone)]
pub struct AdamW {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
    step: u64,
}

impl AdamW {
    #[must_use]
    pub fn new(weight_decay: f32) -> Self {
        Self { beta1: 0.9, beta2: 0.999, epsilon: 1e-8, weight_decay, step: 0 }
    }

    /// Advances the shared step counter; call once per optimizer step, before `update`.
    pub fn begin_step(&mut self) {
        self.step += 1;
    }

    #[must_use]
    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// Applies one update to `params` from `grads` using `state`.
    pub fn update(&self, lr: f32, params: &mut [f32], grads: &[f32], state: &mut AdamState) {
        debug_assert_eq!(params.len(), grads.len());
        if state.m.len() != params.len() {
            state.m = vec![0.0; params.len()];
            state.v = vec![0.0; params.len()];
        }

        let t = self.step.max(1) as i32;
        let bias1 = 1.0 - self.beta1.powi(t);
        let bias2 = 1.0 - self.beta2.powi(t);

        for i in 0..params.len() {
            let g = grads[i];
            state.m[i] = self.beta1 * state.m[i] + (1.0 - self.beta1) * g;
            state.v[i] = self.beta2 * state.v[i] + (1.0 - self.beta2) * g * g;
            let m_hat = state.m[i] / bias1;
            let v_hat = state.v[i] / bias2;
            params[i] -= lr * (m_hat / (v_hat.sqrt() + self.epsilon) + self.weight_decay * params[i]);
        }
    }
}

/// Linear decay from `base_lr` to zero over `total_steps`, no warmup.
#[derive(Debug, Clone, Copy)]
pub struct LinearSchedule {
    pub base_lr: f32,
    pub total_steps: u64,
}

impl LinearSchedule {
    #[must_use]
    pub fn lr_at(&self, step: u64) -> f32 {
        if self.total_steps == 0 {
            return self.base_lr;
        }
        let remaining = self.total_steps.saturating_sub(step) as f32 / self.total_steps as f32;
        self.base_lr * remaining
    }
}
