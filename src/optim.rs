//! AdamW with exportable moments, and gradient-norm clipping

use crate::error::poisoned_var_map;
use candle_core::backprop::GradStore;
use candle_core::{DType, Result, Tensor, Var};
use candle_nn::{Optimizer, ParamsAdamW, VarMap};
use std::collections::HashMap;

#[derive(Debug)]
struct VarAdamW {
    name: String,
    var: Var,
    first_moment: Var,
    second_moment: Var,
}

/// Snapshot of the optimizer's moments, keyed by variable name
#[derive(Debug, Clone, Default)]
pub struct OptimizerState {
    pub step_t: usize,
    pub first_moments: HashMap<String, Tensor>,
    pub second_moments: HashMap<String, Tensor>,
}

/// AdamW with decoupled weight decay and bias-corrected moments
///
/// Unlike `candle_nn::AdamW`, every variable keeps its `VarMap` name so the
/// moments can be checkpointed and restored.
#[derive(Debug)]
pub struct AdamW {
    vars: Vec<VarAdamW>,
    step_t: usize,
    params: ParamsAdamW,
}

impl AdamW {
    fn from_named(named: Vec<(String, Var)>, params: ParamsAdamW) -> Result<Self> {
        let vars = named
            .into_iter()
            .filter(|(_, var)| var.dtype().is_float())
            .map(|(name, var)| {
                let dtype = var.dtype();
                let shape = var.shape();
                let device = var.device();
                let first_moment = Var::zeros(shape, dtype, device)?;
                let second_moment = Var::zeros(shape, dtype, device)?;
                Ok(VarAdamW {
                    name,
                    var,
                    first_moment,
                    second_moment,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            vars,
            step_t: 0,
            params,
        })
    }

    /// Builds an optimizer over every variable of `varmap`, sorted by name.
    pub fn from_varmap(varmap: &VarMap, params: ParamsAdamW) -> Result<Self> {
        let data = varmap.data().lock().map_err(poisoned_var_map)?;
        let mut named: Vec<(String, Var)> =
            data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        Self::from_named(named, params)
    }

    pub fn params(&self) -> &ParamsAdamW {
        &self.params
    }

    pub fn step_t(&self) -> usize {
        self.step_t
    }

    /// Trainable variables, in optimizer order
    pub fn vars(&self) -> Vec<Var> {
        self.vars.iter().map(|v| v.var.clone()).collect()
    }

    pub fn export_state(&self) -> Result<OptimizerState> {
        let mut state = OptimizerState {
            step_t: self.step_t,
            ..Default::default()
        };
        for v in self.vars.iter() {
            state
                .first_moments
                .insert(v.name.clone(), v.first_moment.as_tensor().copy()?);
            state
                .second_moments
                .insert(v.name.clone(), v.second_moment.as_tensor().copy()?);
        }
        Ok(state)
    }

    /// Restores moments saved by `export_state`. Every variable must be present.
    pub fn import_state(&mut self, state: &OptimizerState) -> Result<()> {
        for v in self.vars.iter() {
            let (Some(m), Some(s)) = (
                state.first_moments.get(&v.name),
                state.second_moments.get(&v.name),
            ) else {
                candle_core::bail!("optimizer state is missing moments for `{}`", v.name)
            };
            v.first_moment.set(&m.to_dtype(v.var.dtype())?)?;
            v.second_moment.set(&s.to_dtype(v.var.dtype())?)?;
        }
        self.step_t = state.step_t;
        Ok(())
    }
}

impl Optimizer for AdamW {
    type Config = ParamsAdamW;

    fn new(vars: Vec<Var>, params: ParamsAdamW) -> Result<Self> {
        let named = vars
            .into_iter()
            .enumerate()
            .map(|(ix, var)| (format!("param.{ix}"), var))
            .collect();
        Self::from_named(named, params)
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_t += 1;
        let lr = self.params.lr;
        let lr_lambda = lr * self.params.weight_decay;
        let beta1 = self.params.beta1;
        let beta2 = self.params.beta2;
        let scale_m = 1f64 / (1f64 - beta1.powi(self.step_t as i32));
        let scale_v = 1f64 / (1f64 - beta2.powi(self.step_t as i32));
        for v in self.vars.iter() {
            let theta = &v.var;
            let m = &v.first_moment;
            let s = &v.second_moment;
            if let Some(g) = grads.get(theta) {
                let next_m = ((m.as_tensor() * beta1)? + (g * (1.0 - beta1))?)?;
                let next_s = ((s.as_tensor() * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;
                let m_hat = (&next_m * scale_m)?;
                let s_hat = (&next_s * scale_v)?;
                let next_theta = (theta.as_tensor() * (1f64 - lr_lambda))?;
                let adjusted_grad = (m_hat / (s_hat.sqrt()? + self.params.eps)?)?;
                let next_theta = (next_theta - (adjusted_grad * lr)?)?;
                m.set(&next_m)?;
                s.set(&next_s)?;
                theta.set(&next_theta)?;
            }
        }
        Ok(())
    }
}

/// Rescales gradients in place so their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut sum_sq = 0f64;
    for var in vars.iter() {
        if let Some(g) = grads.get(var) {
            sum_sq += g
                .sqr()?
                .sum_all()?
                .to_dtype(DType::F64)?
                .to_scalar::<f64>()?;
        }
    }
    let total_norm = sum_sq.sqrt();
    if total_norm > max_norm {
        let scale = max_norm / (total_norm + 1e-6);
        for var in vars.iter() {
            if let Some(g) = grads.get(var) {
                let clipped = (g * scale)?;
                grads.insert(var, clipped);
            }
        }
    }
    Ok(total_norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use candle_core::Device;
    use candle_nn::{Init, VarBuilder};
    use rstest::*;

    #[fixture]
    fn params() -> ParamsAdamW {
        ParamsAdamW {
            lr: 0.1,
            weight_decay: 0.01,
            ..Default::default()
        }
    }

    fn quadratic_varmap() -> Result<VarMap> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let _a = vb.get_with_hints(3, "a", Init::Const(2.))?;
        let _b = vb.get_with_hints((2, 2), "b", Init::Const(-1.))?;
        Ok(varmap)
    }

    fn quadratic_loss(varmap: &VarMap) -> Result<Tensor> {
        let vars = varmap.all_vars();
        let mut total = Tensor::new(0f32, &Device::Cpu)?;
        for var in vars.iter() {
            total = (total + var.as_tensor().sqr()?.sum_all()?)?;
        }
        Ok(total)
    }

    #[rstest]
    fn test_adamw_matches_candle(params: ParamsAdamW) -> Result<()> {
        let ours = Var::new(&[1f32, -2., 3.], &Device::Cpu)?;
        let theirs = Var::new(&[1f32, -2., 3.], &Device::Cpu)?;
        let mut opt = <AdamW as Optimizer>::new(vec![ours.clone()], params.clone())?;
        let mut reference = candle_nn::AdamW::new(vec![theirs.clone()], params)?;

        for _ in 0..3 {
            let ours_loss = ours.as_tensor().sqr()?.sum_all()?;
            let theirs_loss = theirs.as_tensor().sqr()?.sum_all()?;
            opt.backward_step(&ours_loss)?;
            reference.backward_step(&theirs_loss)?;
        }
        let diff = (ours.as_tensor() - theirs.as_tensor())?
            .abs()?
            .max_all()?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        assert_eq!(opt.step_t(), 3);
        Ok(())
    }

    #[rstest]
    fn test_adamw_from_varmap_decreases_loss(params: ParamsAdamW) -> Result<()> {
        let varmap = quadratic_varmap()?;
        let mut opt = AdamW::from_varmap(&varmap, params)?;
        let before = quadratic_loss(&varmap)?.to_scalar::<f32>()?;
        for _ in 0..5 {
            opt.backward_step(&quadratic_loss(&varmap)?)?;
        }
        let after = quadratic_loss(&varmap)?.to_scalar::<f32>()?;

        assert_eq!(opt.vars().len(), 2);
        assert!(after < before);
        Ok(())
    }

    #[rstest]
    fn test_export_import_state(params: ParamsAdamW) -> Result<()> {
        let varmap = quadratic_varmap()?;
        let mut opt = AdamW::from_varmap(&varmap, params.clone())?;
        opt.backward_step(&quadratic_loss(&varmap)?)?;
        let state = opt.export_state()?;

        assert_eq!(state.step_t, 1);
        assert_eq!(state.first_moments.len(), 2);
        assert!(state.first_moments.contains_key("a"));

        let mut restored = AdamW::from_varmap(&varmap, params)?;
        restored.import_state(&state)?;
        let again = restored.export_state()?;
        assert_eq!(again.step_t, 1);
        assert_eq!(
            again.second_moments["b"].flatten_all()?.to_vec1::<f32>()?,
            state.second_moments["b"].flatten_all()?.to_vec1::<f32>()?
        );
        Ok(())
    }

    #[rstest]
    fn test_import_state_requires_all_vars(params: ParamsAdamW) -> Result<()> {
        let varmap = quadratic_varmap()?;
        let mut opt = AdamW::from_varmap(&varmap, params)?;
        assert!(opt.import_state(&OptimizerState::default()).is_err());
        Ok(())
    }

    #[rstest]
    fn test_clip_grad_norm() -> Result<()> {
        let var = Var::new(&[3f32, 4.], &Device::Cpu)?;
        // d/dx (x . x) = 2x, norm 10
        let mut grads = var.as_tensor().sqr()?.sum_all()?.backward()?;
        let vars = vec![var.clone()];

        let norm = clip_grad_norm(&mut grads, &vars, 1.0)?;
        assert!((norm - 10.).abs() < 1e-5);
        let clipped = grads.get(&var).unwrap().to_vec1::<f32>()?;
        let clipped_norm = clipped.iter().map(|g| g * g).sum::<f32>().sqrt();
        assert!((clipped_norm - 1.).abs() < 1e-4);

        let untouched = clip_grad_norm(&mut grads, &vars, 5.0)?;
        assert!(untouched <= 1.0 + 1e-4);
        Ok(())
    }
}
