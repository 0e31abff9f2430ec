//! Network architectures of the neural-auto family.
//!
//! Every network maps a scaled input window `[batch, input_size]` (plus its
//! padding mask) to a one-step output. Parameters live in a [`ParamStore`] of
//! candle `Var`s so the optimizer and the checkpoint writer can reach them.

use std::collections::HashMap;

use candle_core::{D, DType, Device, Result, Tensor, Var};
use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Uniform};

use super::{NeuralArch, TrialParams};

/// Named trainable parameters.
#[derive(Default)]
pub struct ParamStore {
    vars: Vec<(String, Var)>,
}

impl ParamStore {
    /// Register a parameter drawn from `U(-bound, bound)`.
    fn uniform(&mut self, name: String, dims: &[usize], bound: f64, device: &Device, rng: &mut StdRng) -> Result<Tensor> {
        let n: usize = dims.iter().product();
        let data: Vec<f32> = if bound > 0.0 {
            let dist = Uniform::new_inclusive(-bound, bound);
            (0..n).map(|_| dist.sample(rng) as f32).collect()
        } else {
            vec![0.0; n]
        };
        let var = Var::from_tensor(&Tensor::from_vec(data, dims, device)?)?;
        let t = var.as_tensor().clone();
        self.vars.push((name, var));
        Ok(t)
    }

    pub fn vars(&self) -> Vec<Var> {
        self.vars.iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Detached copies of every parameter, keyed by name.
    pub fn snapshot(&self) -> Result<HashMap<String, Tensor>> {
        self.vars
            .iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?)))
            .collect()
    }

    /// Overwrite parameters from a snapshot taken on the same architecture.
    pub fn restore(&self, snapshot: &HashMap<String, Tensor>) -> Result<()> {
        for (name, var) in &self.vars {
            if let Some(t) = snapshot.get(name) {
                var.set(t)?;
            }
        }
        Ok(())
    }
}

/// Inverted dropout driven by a seeded RNG; a no-op when inactive.
pub struct Dropout<'a> {
    p: f64,
    rng: Option<&'a mut StdRng>,
}

impl<'a> Dropout<'a> {
    pub fn active(p: f64, rng: &'a mut StdRng) -> Self {
        Self { p, rng: Some(rng) }
    }

    pub fn inactive() -> Self {
        Self { p: 0.0, rng: None }
    }

    fn apply(&mut self, x: &Tensor) -> Result<Tensor> {
        let Some(rng) = self.rng.as_deref_mut() else {
            return Ok(x.clone());
        };
        if self.p <= 0.0 {
            return Ok(x.clone());
        }
        let keep = 1.0 - self.p;
        let scale = (1.0 / keep) as f32;
        let mask: Vec<f32> = (0..x.elem_count())
            .map(|_| if rng.gen_bool(keep) { scale } else { 0.0 })
            .collect();
        x.mul(&Tensor::from_vec(mask, x.dims(), x.device())?)
    }
}

/// Network output for a batch.
pub enum Output {
    /// `[batch]`
    Point(Tensor),
    /// Gaussian mean and standard deviation, each `[batch]`.
    Gaussian { mu: Tensor, sigma: Tensor },
}

impl Output {
    pub fn point(&self) -> &Tensor {
        match self {
            Output::Point(p) => p,
            Output::Gaussian { mu, .. } => mu,
        }
    }

    /// Training loss: L1 for point heads, Gaussian NLL otherwise.
    pub fn loss(&self, y: &Tensor) -> Result<Tensor> {
        match self {
            Output::Point(p) => p.sub(y)?.abs()?.mean_all(),
            Output::Gaussian { mu, sigma } => {
                let z = y.sub(mu)?.div(sigma)?;
                sigma.log()?.add(&z.sqr()?.affine(0.5, 0.0)?)?.mean_all()
            }
        }
    }
}

pub trait Network: Send + Sync {
    fn forward(&self, x: &Tensor, mask: &Tensor, dropout: &mut Dropout) -> Result<Output>;
}

/// A network together with its parameters.
pub struct Model {
    pub arch: NeuralArch,
    pub input_size: usize,
    pub store: ParamStore,
    net: Box<dyn Network>,
}

impl Model {
    pub fn build(arch: NeuralArch, params: &TrialParams, device: &Device, rng: &mut StdRng) -> Result<Self> {
        let mut store = ParamStore::default();
        let l = params.input_size;
        let h = params.width.max(1);
        let depth = params.depth.max(1);
        let mut init = Init {
            store: &mut store,
            device,
            rng,
        };
        let net: Box<dyn Network> = match arch {
            NeuralArch::NLinear => Box::new(NLinear {
                lin: init.linear("linear", l, 1)?,
            }),
            NeuralArch::DLinear => Box::new(DLinear {
                avg: moving_average_matrix(l, device)?,
                trend: init.linear("trend", l, 1)?,
                seasonal: init.linear("seasonal", l, 1)?,
            }),
            NeuralArch::Nbeats => {
                let blocks = (0..depth)
                    .map(|i| MlpBlock::new(&mut init, &format!("blocks.{i}"), l, 1, h))
                    .collect::<Result<Vec<_>>>()?;
                Box::new(Nbeats { blocks })
            }
            NeuralArch::Nhits => {
                let mut blocks = Vec::with_capacity(depth);
                for i in 0..depth {
                    let mut k = 1usize << (depth - 1 - i).min(3);
                    while k > 1 && l % k != 0 {
                        k /= 2;
                    }
                    blocks.push(MlpBlock::new(&mut init, &format!("blocks.{i}"), l, k, h)?);
                }
                Box::new(Nbeats { blocks })
            }
            NeuralArch::Tide => {
                let mut encoder = vec![Residual::new(&mut init, "encoder.0", l, h, h)?];
                for i in 1..depth {
                    encoder.push(Residual::new(&mut init, &format!("encoder.{i}"), h, h, h)?);
                }
                Box::new(Tide {
                    encoder,
                    decoder: Residual::new(&mut init, "decoder", h, h, 1)?,
                    skip: init.linear("skip", l, 1)?,
                })
            }
            NeuralArch::DeepAr => {
                let mut layers = Vec::new();
                for i in 0..depth.min(2) {
                    let input = if i == 0 { 1 } else { h };
                    layers.push(LstmLayer::new(&mut init, &format!("lstm.{i}"), input, h)?);
                }
                Box::new(DeepAr {
                    layers,
                    hidden: h,
                    mu: init.linear("mu", h, 1)?,
                    sigma: init.linear("sigma", h, 1)?,
                })
            }
            NeuralArch::VanillaTransformer => {
                let layers = (0..depth)
                    .map(|i| EncoderLayer::new(&mut init, &format!("encoder.{i}"), h))
                    .collect::<Result<Vec<_>>>()?;
                Box::new(Transformer {
                    embed: init.linear("embed", 1, h)?,
                    position: init.tensor("position", &[l, h], 0.02)?,
                    layers,
                    head: init.linear("head", h, 1)?,
                })
            }
        };
        Ok(Self {
            arch,
            input_size: l,
            store,
            net,
        })
    }

    pub fn forward(&self, x: &Tensor, mask: &Tensor, dropout: &mut Dropout) -> Result<Output> {
        self.net.forward(x, mask, dropout)
    }
}

struct Init<'a> {
    store: &'a mut ParamStore,
    device: &'a Device,
    rng: &'a mut StdRng,
}

impl Init<'_> {
    fn tensor(&mut self, name: &str, dims: &[usize], bound: f64) -> Result<Tensor> {
        self.store
            .uniform(name.to_string(), dims, bound, self.device, self.rng)
    }

    fn linear(&mut self, name: &str, input: usize, output: usize) -> Result<Linear> {
        let bound = 1.0 / (input.max(1) as f64).sqrt();
        Ok(Linear {
            w: self.tensor(&format!("{name}.weight"), &[input, output], bound)?,
            b: self.tensor(&format!("{name}.bias"), &[output], bound)?,
        })
    }
}

struct Linear {
    /// `[in, out]`
    w: Tensor,
    b: Tensor,
}

impl Linear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let y = if x.rank() == 2 {
            x.matmul(&self.w)?
        } else {
            x.broadcast_matmul(&self.w)?
        };
        y.broadcast_add(&self.b)
    }
}

fn sigmoid(x: &Tensor) -> Result<Tensor> {
    x.neg()?.exp()?.affine(1.0, 1.0)?.recip()
}

fn softplus(x: &Tensor) -> Result<Tensor> {
    x.clamp(-20f32, 20f32)?.exp()?.affine(1.0, 1.0)?.log()
}

fn softmax_last(x: &Tensor) -> Result<Tensor> {
    let max = x.max_keepdim(D::Minus1)?;
    let e = x.broadcast_sub(&max)?.exp()?;
    let sum = e.sum_keepdim(D::Minus1)?;
    e.broadcast_div(&sum)
}

fn layer_norm(x: &Tensor) -> Result<Tensor> {
    let mean = x.mean_keepdim(D::Minus1)?;
    let centered = x.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
    centered.broadcast_div(&var.affine(1.0, 1e-5)?.sqrt()?)
}

/// Replicate-padded centred moving average as a `[L, L]` matrix.
fn moving_average_matrix(l: usize, device: &Device) -> Result<Tensor> {
    let mut k = l.min(25);
    if k % 2 == 0 {
        k = k.saturating_sub(1).max(1);
    }
    let r = (k / 2) as i64;
    let mut a = vec![0f32; l * l];
    for j in 0..l as i64 {
        for o in -r..=r {
            let i = (j + o).clamp(0, l as i64 - 1) as usize;
            a[i * l + j as usize] += 1.0 / k as f32;
        }
    }
    Tensor::from_vec(a, (l, l), device)
}

struct NLinear {
    lin: Linear,
}

impl Network for NLinear {
    fn forward(&self, x: &Tensor, _mask: &Tensor, _dropout: &mut Dropout) -> Result<Output> {
        let l = x.dim(1)?;
        let last = x.narrow(1, l - 1, 1)?;
        let y = self.lin.forward(&x.broadcast_sub(&last)?)?.add(&last)?;
        Ok(Output::Point(y.squeeze(1)?))
    }
}

struct DLinear {
    avg: Tensor,
    trend: Linear,
    seasonal: Linear,
}

impl Network for DLinear {
    fn forward(&self, x: &Tensor, _mask: &Tensor, _dropout: &mut Dropout) -> Result<Output> {
        let trend = x.matmul(&self.avg)?;
        let seasonal = x.sub(&trend)?;
        let y = self
            .trend
            .forward(&trend)?
            .add(&self.seasonal.forward(&seasonal)?)?;
        Ok(Output::Point(y.squeeze(1)?))
    }
}

/// Doubly residual block: two hidden layers, a backcast and a forecast head.
/// `pool > 1` max-pools the input first (hierarchical interpolation).
struct MlpBlock {
    pool: usize,
    hidden: [Linear; 2],
    backcast: Linear,
    forecast: Linear,
}

impl MlpBlock {
    fn new(init: &mut Init, name: &str, l: usize, pool: usize, h: usize) -> Result<Self> {
        Ok(Self {
            pool,
            hidden: [
                init.linear(&format!("{name}.fc0"), l / pool, h)?,
                init.linear(&format!("{name}.fc1"), h, h)?,
            ],
            backcast: init.linear(&format!("{name}.backcast"), h, l)?,
            forecast: init.linear(&format!("{name}.forecast"), h, 1)?,
        })
    }

    fn forward(&self, residual: &Tensor, dropout: &mut Dropout) -> Result<(Tensor, Tensor)> {
        let input = if self.pool > 1 {
            let (b, l) = residual.dims2()?;
            residual.reshape((b, l / self.pool, self.pool))?.max(2)?
        } else {
            residual.clone()
        };
        let mut h = input;
        for layer in &self.hidden {
            h = dropout.apply(&layer.forward(&h)?.relu()?)?;
        }
        Ok((self.backcast.forward(&h)?, self.forecast.forward(&h)?))
    }
}

struct Nbeats {
    blocks: Vec<MlpBlock>,
}

impl Network for Nbeats {
    fn forward(&self, x: &Tensor, _mask: &Tensor, dropout: &mut Dropout) -> Result<Output> {
        let mut residual = x.clone();
        let mut forecast: Option<Tensor> = None;
        for block in &self.blocks {
            let (back, fore) = block.forward(&residual, dropout)?;
            residual = residual.sub(&back)?;
            forecast = Some(match forecast {
                Some(f) => f.add(&fore)?,
                None => fore,
            });
        }
        let y = match forecast {
            Some(f) => f,
            None => x.narrow(1, x.dim(1)? - 1, 1)?,
        };
        Ok(Output::Point(y.squeeze(1)?))
    }
}

/// Dense residual block with a linear skip connection.
struct Residual {
    fc: Linear,
    out: Linear,
    skip: Linear,
}

impl Residual {
    fn new(init: &mut Init, name: &str, input: usize, hidden: usize, output: usize) -> Result<Self> {
        Ok(Self {
            fc: init.linear(&format!("{name}.fc"), input, hidden)?,
            out: init.linear(&format!("{name}.out"), hidden, output)?,
            skip: init.linear(&format!("{name}.skip"), input, output)?,
        })
    }

    fn forward(&self, x: &Tensor, dropout: &mut Dropout) -> Result<Tensor> {
        let h = dropout.apply(&self.fc.forward(x)?.relu()?)?;
        self.out.forward(&h)?.add(&self.skip.forward(x)?)
    }
}

struct Tide {
    encoder: Vec<Residual>,
    decoder: Residual,
    skip: Linear,
}

impl Network for Tide {
    fn forward(&self, x: &Tensor, _mask: &Tensor, dropout: &mut Dropout) -> Result<Output> {
        let mut h = x.clone();
        for block in &self.encoder {
            h = block.forward(&h, dropout)?;
        }
        let y = self.decoder.forward(&h, dropout)?.add(&self.skip.forward(x)?)?;
        Ok(Output::Point(y.squeeze(1)?))
    }
}

struct LstmLayer {
    w_ih: Tensor,
    w_hh: Tensor,
    b: Tensor,
}

impl LstmLayer {
    fn new(init: &mut Init, name: &str, input: usize, hidden: usize) -> Result<Self> {
        let bound = 1.0 / (hidden as f64).sqrt();
        Ok(Self {
            w_ih: init.tensor(&format!("{name}.w_ih"), &[input, 4 * hidden], bound)?,
            w_hh: init.tensor(&format!("{name}.w_hh"), &[hidden, 4 * hidden], bound)?,
            b: init.tensor(&format!("{name}.bias"), &[4 * hidden], bound)?,
        })
    }

    fn step(&self, x: &Tensor, h: &Tensor, c: &Tensor, hidden: usize) -> Result<(Tensor, Tensor)> {
        let gates = x
            .matmul(&self.w_ih)?
            .add(&h.matmul(&self.w_hh)?)?
            .broadcast_add(&self.b)?;
        let i = sigmoid(&gates.narrow(1, 0, hidden)?)?;
        let f = sigmoid(&gates.narrow(1, hidden, hidden)?)?;
        let g = gates.narrow(1, 2 * hidden, hidden)?.tanh()?;
        let o = sigmoid(&gates.narrow(1, 3 * hidden, hidden)?)?;
        let c = f.mul(c)?.add(&i.mul(&g)?)?;
        let h = o.mul(&c.tanh()?)?;
        Ok((h, c))
    }
}

struct DeepAr {
    layers: Vec<LstmLayer>,
    hidden: usize,
    mu: Linear,
    sigma: Linear,
}

impl Network for DeepAr {
    fn forward(&self, x: &Tensor, _mask: &Tensor, dropout: &mut Dropout) -> Result<Output> {
        let (b, l) = x.dims2()?;
        let zeros = Tensor::zeros((b, self.hidden), DType::F32, x.device())?;
        let mut state: Vec<(Tensor, Tensor)> = self
            .layers
            .iter()
            .map(|_| (zeros.clone(), zeros.clone()))
            .collect();
        for t in 0..l {
            let mut input = x.narrow(1, t, 1)?;
            for (layer, (h, c)) in self.layers.iter().zip(state.iter_mut()) {
                let (h_next, c_next) = layer.step(&input, h, c, self.hidden)?;
                *h = h_next;
                *c = c_next;
                input = h.clone();
            }
        }
        let top = match state.last() {
            Some((h, _)) => dropout.apply(h)?,
            None => zeros,
        };
        let mu = self.mu.forward(&top)?.squeeze(1)?;
        let sigma = softplus(&self.sigma.forward(&top)?)?
            .affine(1.0, 1e-3)?
            .squeeze(1)?;
        Ok(Output::Gaussian { mu, sigma })
    }
}

struct EncoderLayer {
    q: Linear,
    k: Linear,
    v: Linear,
    o: Linear,
    ff: [Linear; 2],
}

impl EncoderLayer {
    fn new(init: &mut Init, name: &str, d: usize) -> Result<Self> {
        Ok(Self {
            q: init.linear(&format!("{name}.q"), d, d)?,
            k: init.linear(&format!("{name}.k"), d, d)?,
            v: init.linear(&format!("{name}.v"), d, d)?,
            o: init.linear(&format!("{name}.o"), d, d)?,
            ff: [
                init.linear(&format!("{name}.ff0"), d, 2 * d)?,
                init.linear(&format!("{name}.ff1"), 2 * d, d)?,
            ],
        })
    }

    /// `x`: `[batch, L, d]`; `key_bias`: `[batch, 1, L]`.
    fn forward(&self, x: &Tensor, key_bias: &Tensor, dropout: &mut Dropout) -> Result<Tensor> {
        let d = x.dim(2)?;
        let q = self.q.forward(x)?;
        let k = self.k.forward(x)?.transpose(1, 2)?.contiguous()?;
        let v = self.v.forward(x)?;
        let scores = q
            .matmul(&k)?
            .affine(1.0 / (d as f64).sqrt(), 0.0)?
            .broadcast_add(key_bias)?;
        let attn = softmax_last(&scores)?.matmul(&v)?;
        let x = layer_norm(&x.add(&dropout.apply(&self.o.forward(&attn)?)?)?)?;
        let ff = self.ff[1].forward(&dropout.apply(&self.ff[0].forward(&x)?.relu()?)?)?;
        layer_norm(&x.add(&ff)?)
    }
}

struct Transformer {
    embed: Linear,
    position: Tensor,
    layers: Vec<EncoderLayer>,
    head: Linear,
}

impl Network for Transformer {
    fn forward(&self, x: &Tensor, mask: &Tensor, dropout: &mut Dropout) -> Result<Output> {
        let l = x.dim(1)?;
        let mut h = self
            .embed
            .forward(&x.unsqueeze(2)?)?
            .broadcast_add(&self.position)?;
        // Padded keys get a large negative bias.
        let key_bias = mask.affine(1e9, -1e9)?.unsqueeze(1)?;
        for layer in &self.layers {
            h = layer.forward(&h, &key_bias, dropout)?;
        }
        let last = h.narrow(1, l - 1, 1)?.squeeze(1)?;
        Ok(Output::Point(self.head.forward(&last)?.squeeze(1)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn params(input_size: usize) -> TrialParams {
        TrialParams {
            input_size,
            learning_rate: 1e-3,
            max_steps: 10,
            batch_size: 4,
            scaler: crate::neural::ScalerKind::Standard,
            depth: 2,
            width: 8,
            dropout: 0.1,
        }
    }

    #[test]
    fn every_architecture_produces_one_value_per_row() {
        let dev = Device::Cpu;
        let x = Tensor::from_vec((0..24).map(|v| v as f32 / 10.0).collect::<Vec<_>>(), (3, 8), &dev).unwrap();
        let mask = Tensor::ones((3, 8), DType::F32, &dev).unwrap();
        let y = Tensor::zeros(3, DType::F32, &dev).unwrap();
        for arch in NeuralArch::ALL {
            let mut rng = StdRng::seed_from_u64(1);
            let model = Model::build(arch, &params(8), &dev, &mut rng).unwrap();
            assert!(!model.store.is_empty());
            let mut drop_rng = StdRng::seed_from_u64(2);
            let out = model
                .forward(&x, &mask, &mut Dropout::active(0.1, &mut drop_rng))
                .unwrap();
            assert_eq!(out.point().dims(), &[3], "{arch}");
            let loss = out.loss(&y).unwrap().to_scalar::<f32>().unwrap();
            assert!(loss.is_finite(), "{arch}");
        }
    }

    #[test]
    fn moving_average_columns_sum_to_one() {
        let a = moving_average_matrix(6, &Device::Cpu).unwrap();
        let cols = a.sum(0).unwrap().to_vec1::<f32>().unwrap();
        assert!(cols.iter().all(|c| (c - 1.0).abs() < 1e-6));
    }

    #[test]
    fn snapshot_restores_parameters() {
        let dev = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(3);
        let model = Model::build(NeuralArch::NLinear, &params(4), &dev, &mut rng).unwrap();
        let snap = model.store.snapshot().unwrap();
        for var in model.store.vars() {
            var.set(&var.as_tensor().zeros_like().unwrap()).unwrap();
        }
        model.store.restore(&snap).unwrap();
        let w = model.store.snapshot().unwrap();
        let a = snap["linear.weight"].flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = w["linear.weight"].flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn gaussian_loss_prefers_the_right_mean() {
        let dev = Device::Cpu;
        let y = Tensor::new(&[1.0f32, 1.0], &dev).unwrap();
        let sigma = Tensor::new(&[1.0f32, 1.0], &dev).unwrap();
        let good = Output::Gaussian {
            mu: y.clone(),
            sigma: sigma.clone(),
        };
        let bad = Output::Gaussian {
            mu: Tensor::new(&[3.0f32, 3.0], &dev).unwrap(),
            sigma,
        };
        let lg = good.loss(&y).unwrap().to_scalar::<f32>().unwrap();
        let lb = bad.loss(&y).unwrap().to_scalar::<f32>().unwrap();
        assert!(lg < lb);
    }
}
