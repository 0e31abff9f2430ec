//! Adam over candle variables.
//!
//! ```text
//! m = beta1 * m + (1 - beta1) * g
//! v = beta2 * v + (1 - beta2) * g^2
//! w = w - lr * m_hat / (sqrt(v_hat) + epsilon)
//! ```

use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
}

impl AdamConfig {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

struct Slot {
    var: Var,
    m: Tensor,
    v: Tensor,
}

pub struct Adam {
    config: AdamConfig,
    slots: Vec<Slot>,
    t: i32,
}

impl Adam {
    pub fn new(vars: Vec<Var>, config: AdamConfig) -> Result<Self> {
        let slots = vars
            .into_iter()
            .map(|var| {
                let m = var.as_tensor().zeros_like()?;
                let v = var.as_tensor().zeros_like()?;
                Ok(Slot { var, m, v })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { config, slots, t: 0 })
    }

    pub fn timestep(&self) -> i32 {
        self.t
    }

    /// Apply one update from the gradients of `loss`.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let grads = loss.backward()?;
        self.step(&grads)
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.t += 1;
        let AdamConfig {
            learning_rate,
            beta1,
            beta2,
            epsilon,
        } = self.config;
        let bias1 = 1.0 - beta1.powi(self.t);
        let bias2 = 1.0 - beta2.powi(self.t);

        for slot in &mut self.slots {
            let Some(g) = grads.get(slot.var.as_tensor()) else {
                continue;
            };
            slot.m = slot.m.affine(beta1, 0.0)?.add(&g.affine(1.0 - beta1, 0.0)?)?;
            slot.v = slot.v.affine(beta2, 0.0)?.add(&g.sqr()?.affine(1.0 - beta2, 0.0)?)?;
            let m_hat = slot.m.affine(1.0 / bias1, 0.0)?;
            let v_hat = slot.v.affine(1.0 / bias2, 0.0)?;
            let update = m_hat.div(&v_hat.sqrt()?.affine(1.0, epsilon)?)?;
            let next = slot.var.as_tensor().sub(&update.affine(learning_rate, 0.0)?)?;
            slot.var.set(&next.detach())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn minimises_a_quadratic() {
        let w = Var::new(&[5.0f32, -3.0], &Device::Cpu).unwrap();
        let mut opt = Adam::new(vec![w.clone()], AdamConfig::new(0.1)).unwrap();
        for _ in 0..500 {
            let loss = w.as_tensor().sqr().unwrap().sum_all().unwrap();
            opt.backward_step(&loss).unwrap();
        }
        let values = w.as_tensor().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| v.abs() < 0.05), "{values:?}");
        assert_eq!(opt.timestep(), 500);
    }

    #[test]
    fn first_step_moves_by_learning_rate() {
        let w = Var::new(&[1.0f32], &Device::Cpu).unwrap();
        let mut opt = Adam::new(vec![w.clone()], AdamConfig::new(0.01)).unwrap();
        let loss = w.as_tensor().affine(3.0, 0.0).unwrap().sum_all().unwrap();
        opt.backward_step(&loss).unwrap();
        let v = w.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((v - 0.99).abs() < 1e-5);
    }
}
