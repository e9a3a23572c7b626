//! The neural character model.
//!
//! Architecture (fixed by [`NeuralConfig`] dimensions): symbol embedding →
//! 1-D convolution (zero padded, ReLU) → two stacked bidirectional tanh
//! recurrent layers (forward/backward states concatenated per position) →
//! scaled dot-product self-attention → feed-forward head with one hidden
//! ReLU layer and dropout → logits over the alphabet.
//!
//! Only the final position's attended vector feeds the head, so the
//! attention query is computed for that position alone; keys and values
//! cover every position. Forward and backward passes are hand-written; the
//! optimizer lives in [`super::train`].

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::config::NeuralConfig;
use super::tensor::{Mat, add_assign, dot, softmax};
use crate::alphabet;
use crate::error::Result;

/// Number of stacked bidirectional recurrent layers.
pub const STACKED_LAYERS: usize = 2;

/// One recurrent direction: input, recurrent and bias weights.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RnnDir {
    pub wx: Mat,
    pub wh: Mat,
    pub b: Mat,
}

/// All learned parameters, in a fixed iteration order shared by the
/// optimizer and the checkpoint codec.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Params {
    pub embed: Mat,
    pub conv_w: Mat,
    pub conv_b: Mat,
    /// `[layer0 fwd, layer0 bwd, layer1 fwd, layer1 bwd]`
    pub rnn: Vec<RnnDir>,
    pub attn_q: Mat,
    pub attn_k: Mat,
    pub attn_v: Mat,
    pub ff_w1: Mat,
    pub ff_b1: Mat,
    pub ff_w2: Mat,
    pub ff_b2: Mat,
}

impl Params {
    fn init(cfg: &NeuralConfig, rng: &mut StdRng) -> Self {
        let v = alphabet::SIZE;
        let e = cfg.embed_dim;
        let c = cfg.conv_channels;
        let h = cfg.hidden_dim;
        let d = 2 * h;
        let f = cfg.ff_hidden;

        let mut rnn = Vec::with_capacity(2 * STACKED_LAYERS);
        for layer in 0..STACKED_LAYERS {
            let in_dim = if layer == 0 { c } else { d };
            for _ in 0..2 {
                rnn.push(RnnDir {
                    wx: Mat::uniform(in_dim, h, rng),
                    wh: Mat::uniform(h, h, rng),
                    b: Mat::zeros(1, h),
                });
            }
        }

        Self {
            embed: Mat::uniform(v, e, rng),
            conv_w: Mat::uniform(cfg.kernel * e, c, rng),
            conv_b: Mat::zeros(1, c),
            rnn,
            attn_q: Mat::uniform(d, d, rng),
            attn_k: Mat::uniform(d, d, rng),
            attn_v: Mat::uniform(d, d, rng),
            ff_w1: Mat::uniform(d, f, rng),
            ff_b1: Mat::zeros(1, f),
            ff_w2: Mat::uniform(f, v, rng),
            ff_b2: Mat::zeros(1, v),
        }
    }

    pub fn zeros_like(&self) -> Self {
        Self {
            embed: self.embed.zeros_like(),
            conv_w: self.conv_w.zeros_like(),
            conv_b: self.conv_b.zeros_like(),
            rnn: self
                .rnn
                .iter()
                .map(|d| RnnDir {
                    wx: d.wx.zeros_like(),
                    wh: d.wh.zeros_like(),
                    b: d.b.zeros_like(),
                })
                .collect(),
            attn_q: self.attn_q.zeros_like(),
            attn_k: self.attn_k.zeros_like(),
            attn_v: self.attn_v.zeros_like(),
            ff_w1: self.ff_w1.zeros_like(),
            ff_b1: self.ff_b1.zeros_like(),
            ff_w2: self.ff_w2.zeros_like(),
            ff_b2: self.ff_b2.zeros_like(),
        }
    }

    pub fn mats(&self) -> Vec<&Mat> {
        let mut v = vec![&self.embed, &self.conv_w, &self.conv_b];
        for dir in &self.rnn {
            v.push(&dir.wx);
            v.push(&dir.wh);
            v.push(&dir.b);
        }
        v.extend([
            &self.attn_q,
            &self.attn_k,
            &self.attn_v,
            &self.ff_w1,
            &self.ff_b1,
            &self.ff_w2,
            &self.ff_b2,
        ]);
        v
    }

    pub fn mats_mut(&mut self) -> Vec<&mut Mat> {
        let mut v: Vec<&mut Mat> = vec![&mut self.embed, &mut self.conv_w, &mut self.conv_b];
        for dir in &mut self.rnn {
            v.push(&mut dir.wx);
            v.push(&mut dir.wh);
            v.push(&mut dir.b);
        }
        v.extend([
            &mut self.attn_q,
            &mut self.attn_k,
            &mut self.attn_v,
            &mut self.ff_w1,
            &mut self.ff_b1,
            &mut self.ff_w2,
            &mut self.ff_b2,
        ]);
        v
    }
}

/// Per-example forward activations retained for the backward pass.
pub(crate) struct Cache {
    pub idx: Vec<usize>,
    pub patches: Vec<Vec<f32>>,
    pub conv_pre: Vec<Vec<f32>>,
    pub conv: Vec<Vec<f32>>,
    /// `h[layer] = [forward states, backward states]`, each window × hidden.
    pub h: Vec<[Vec<Vec<f32>>; 2]>,
    /// Concatenated per-layer outputs, window × 2·hidden.
    pub outs: Vec<Vec<Vec<f32>>>,
    pub k_rows: Vec<Vec<f32>>,
    pub v_rows: Vec<Vec<f32>>,
    pub q_last: Vec<f32>,
    pub attn_w: Vec<f32>,
    pub att_last: Vec<f32>,
    pub ff_pre: Vec<f32>,
    pub ff_h: Vec<f32>,
    pub drop_mask: Option<Vec<f32>>,
    pub logits: Vec<f32>,
}

/// The character model: configuration plus parameters.
#[derive(Debug, Clone)]
pub struct CharModel {
    cfg: NeuralConfig,
    pub(crate) params: Params,
}

impl CharModel {
    /// Fresh model with seeded initialization.
    pub fn new(cfg: NeuralConfig, seed: u64) -> Self {
        debug_assert_eq!(cfg.kernel % 2, 1, "convolution kernel must be odd");
        let mut rng = StdRng::seed_from_u64(seed);
        let params = Params::init(&cfg, &mut rng);
        Self { cfg, params }
    }

    pub fn config(&self) -> &NeuralConfig {
        &self.cfg
    }

    /// Symbol indices for `context`, truncated to the last `window` symbols
    /// and left-padded with the word separator.
    pub(crate) fn window_indices(&self, context: &str) -> Result<Vec<usize>> {
        alphabet::check(context)?;
        let w = self.cfg.window;
        let mut tail: Vec<usize> = context
            .chars()
            .rev()
            .take(w)
            .filter_map(alphabet::index_of)
            .collect();
        tail.reverse();
        let mut idx = vec![alphabet::SEPARATOR_IDX; w - tail.len()];
        idx.append(&mut tail);
        Ok(idx)
    }

    /// Next-symbol probability distribution for `context`.
    ///
    /// Pure inference: no side effects, safe to call concurrently through a
    /// shared reference. The context must be normalized.
    pub fn predict(&self, context: &str) -> Result<[f32; alphabet::SIZE]> {
        let idx = self.window_indices(context)?;
        let cache = self.forward(&idx, None);
        let mut probs = cache.logits;
        softmax(&mut probs);
        let mut out = [0.0; alphabet::SIZE];
        out.copy_from_slice(&probs);
        Ok(out)
    }

    /// Full forward pass over one window of symbol indices.
    ///
    /// `dropout` is `Some((p, rng))` in training mode; inference passes
    /// `None` and is deterministic.
    pub(crate) fn forward(&self, idx: &[usize], dropout: Option<(f32, &mut StdRng)>) -> Cache {
        let cfg = &self.cfg;
        let p = &self.params;
        let w = cfg.window;
        debug_assert_eq!(idx.len(), w);
        let e = cfg.embed_dim;
        let k = cfg.kernel;
        let half = k / 2;
        let hdim = cfg.hidden_dim;
        let d = 2 * hdim;

        // Embedding + convolution patches (zero padded at the edges).
        let mut patches = Vec::with_capacity(w);
        for t in 0..w {
            let mut patch = vec![0.0; k * e];
            for kk in 0..k {
                let src = t as isize + kk as isize - half as isize;
                if src >= 0 && (src as usize) < w {
                    let row = p.embed.row(idx[src as usize]);
                    patch[kk * e..(kk + 1) * e].copy_from_slice(row);
                }
            }
            patches.push(patch);
        }

        let mut conv_pre = Vec::with_capacity(w);
        let mut conv = Vec::with_capacity(w);
        for patch in &patches {
            let mut z = p.conv_w.vecmul(patch);
            add_assign(&mut z, p.conv_b.row(0));
            conv_pre.push(z.clone());
            for x in z.iter_mut() {
                *x = x.max(0.0);
            }
            conv.push(z);
        }

        // Stacked bidirectional recurrent layers.
        let mut h_layers: Vec<[Vec<Vec<f32>>; 2]> = Vec::with_capacity(STACKED_LAYERS);
        let mut outs: Vec<Vec<Vec<f32>>> = Vec::with_capacity(STACKED_LAYERS);
        for layer in 0..STACKED_LAYERS {
            let input: &[Vec<f32>] = if layer == 0 { &conv } else { &outs[layer - 1] };
            let fwd = &p.rnn[2 * layer];
            let bwd = &p.rnn[2 * layer + 1];

            let mut hf: Vec<Vec<f32>> = Vec::with_capacity(w);
            for t in 0..w {
                let mut z = fwd.wx.vecmul(&input[t]);
                if t > 0 {
                    add_assign(&mut z, &fwd.wh.vecmul(&hf[t - 1]));
                }
                add_assign(&mut z, fwd.b.row(0));
                for x in z.iter_mut() {
                    *x = x.tanh();
                }
                hf.push(z);
            }

            let mut hb: Vec<Vec<f32>> = vec![Vec::new(); w];
            for t in (0..w).rev() {
                let mut z = bwd.wx.vecmul(&input[t]);
                if t + 1 < w {
                    add_assign(&mut z, &bwd.wh.vecmul(&hb[t + 1]));
                }
                add_assign(&mut z, bwd.b.row(0));
                for x in z.iter_mut() {
                    *x = x.tanh();
                }
                hb[t] = z;
            }

            let out: Vec<Vec<f32>> = (0..w)
                .map(|t| {
                    let mut row = Vec::with_capacity(d);
                    row.extend_from_slice(&hf[t]);
                    row.extend_from_slice(&hb[t]);
                    row
                })
                .collect();
            h_layers.push([hf, hb]);
            outs.push(out);
        }

        // Self-attention: query at the final position, keys/values everywhere.
        let top = &outs[STACKED_LAYERS - 1];
        let scale = 1.0 / (d as f32).sqrt();
        let q_last = p.attn_q.vecmul(&top[w - 1]);
        let k_rows: Vec<Vec<f32>> = top.iter().map(|o| p.attn_k.vecmul(o)).collect();
        let v_rows: Vec<Vec<f32>> = top.iter().map(|o| p.attn_v.vecmul(o)).collect();

        let mut attn_w: Vec<f32> = k_rows.iter().map(|kr| dot(&q_last, kr) * scale).collect();
        softmax(&mut attn_w);

        let mut att_last = vec![0.0; d];
        for (s, vr) in v_rows.iter().enumerate() {
            for (a, &x) in att_last.iter_mut().zip(vr) {
                *a += attn_w[s] * x;
            }
        }

        // Feed-forward head.
        let mut ff_pre = p.ff_w1.vecmul(&att_last);
        add_assign(&mut ff_pre, p.ff_b1.row(0));
        let mut ff_h: Vec<f32> = ff_pre.iter().map(|&x| x.max(0.0)).collect();

        let drop_mask = dropout.map(|(prob, rng)| {
            let keep = 1.0 - prob;
            let mask: Vec<f32> = ff_h
                .iter()
                .map(|_| {
                    if rng.random::<f32>() < prob {
                        0.0
                    } else {
                        1.0 / keep
                    }
                })
                .collect();
            for (x, &m) in ff_h.iter_mut().zip(&mask) {
                *x *= m;
            }
            mask
        });

        let mut logits = p.ff_w2.vecmul(&ff_h);
        add_assign(&mut logits, p.ff_b2.row(0));

        Cache {
            idx: idx.to_vec(),
            patches,
            conv_pre,
            conv,
            h: h_layers,
            outs,
            k_rows,
            v_rows,
            q_last,
            attn_w,
            att_last,
            ff_pre,
            ff_h,
            drop_mask,
            logits,
        }
    }

    /// Accumulate parameter gradients for one example into `grads`, given
    /// the loss gradient with respect to the logits.
    pub(crate) fn backward(&self, cache: &Cache, dlogits: &[f32], grads: &mut Params) {
        let cfg = &self.cfg;
        let p = &self.params;
        let w = cfg.window;
        let e = cfg.embed_dim;
        let k = cfg.kernel;
        let half = k / 2;
        let hdim = cfg.hidden_dim;
        let d = 2 * hdim;

        // Head.
        add_assign(grads.ff_b2.row_mut(0), dlogits);
        grads.ff_w2.add_outer(&cache.ff_h, dlogits);
        let mut dffh = p.ff_w2.vecmul_t(dlogits);
        if let Some(mask) = &cache.drop_mask {
            for (x, &m) in dffh.iter_mut().zip(mask) {
                *x *= m;
            }
        }
        let dff_pre: Vec<f32> = dffh
            .iter()
            .zip(&cache.ff_pre)
            .map(|(&g, &z)| if z > 0.0 { g } else { 0.0 })
            .collect();
        add_assign(grads.ff_b1.row_mut(0), &dff_pre);
        grads.ff_w1.add_outer(&cache.att_last, &dff_pre);
        let datt_last = p.ff_w1.vecmul_t(&dff_pre);

        // Attention.
        let top = &cache.outs[STACKED_LAYERS - 1];
        let scale = 1.0 / (d as f32).sqrt();
        let dw: Vec<f32> = cache
            .v_rows
            .iter()
            .map(|vr| dot(&datt_last, vr))
            .collect();
        let dw_dot: f32 = dw.iter().zip(&cache.attn_w).map(|(&g, &a)| g * a).sum();
        let dscores: Vec<f32> = cache
            .attn_w
            .iter()
            .zip(&dw)
            .map(|(&a, &g)| a * (g - dw_dot))
            .collect();

        let mut dtop: Vec<Vec<f32>> = vec![vec![0.0; d]; w];
        let mut dq_last = vec![0.0; d];
        for s in 0..w {
            let dv: Vec<f32> = datt_last.iter().map(|&x| x * cache.attn_w[s]).collect();
            grads.attn_v.add_outer(&top[s], &dv);
            add_assign(&mut dtop[s], &p.attn_v.vecmul_t(&dv));

            let dk: Vec<f32> = cache
                .q_last
                .iter()
                .map(|&x| x * dscores[s] * scale)
                .collect();
            grads.attn_k.add_outer(&top[s], &dk);
            add_assign(&mut dtop[s], &p.attn_k.vecmul_t(&dk));

            for (dq, &kx) in dq_last.iter_mut().zip(&cache.k_rows[s]) {
                *dq += dscores[s] * scale * kx;
            }
        }
        grads.attn_q.add_outer(&top[w - 1], &dq_last);
        add_assign(&mut dtop[w - 1], &p.attn_q.vecmul_t(&dq_last));

        // Stacked recurrent layers, top down.
        let mut dout = dtop;
        for layer in (0..STACKED_LAYERS).rev() {
            let input: &[Vec<f32>] = if layer == 0 {
                &cache.conv
            } else {
                &cache.outs[layer - 1]
            };
            let [hf, hb] = &cache.h[layer];
            let fwd = &p.rnn[2 * layer];
            let bwd = &p.rnn[2 * layer + 1];
            let mut dinput = vec![vec![0.0; input[0].len()]; w];

            // Forward direction: dependency flows t-1 → t, so walk back.
            let mut carry = vec![0.0; hdim];
            for t in (0..w).rev() {
                let mut dh = dout[t][..hdim].to_vec();
                add_assign(&mut dh, &carry);
                let dpre: Vec<f32> = dh
                    .iter()
                    .zip(&hf[t])
                    .map(|(&g, &hx)| g * (1.0 - hx * hx))
                    .collect();
                let gf = &mut grads.rnn[2 * layer];
                add_assign(gf.b.row_mut(0), &dpre);
                gf.wx.add_outer(&input[t], &dpre);
                if t > 0 {
                    gf.wh.add_outer(&hf[t - 1], &dpre);
                }
                carry = fwd.wh.vecmul_t(&dpre);
                add_assign(&mut dinput[t], &fwd.wx.vecmul_t(&dpre));
            }

            // Backward direction: dependency flows t+1 → t, so walk forward.
            let mut carry = vec![0.0; hdim];
            for t in 0..w {
                let mut dh = dout[t][hdim..].to_vec();
                add_assign(&mut dh, &carry);
                let dpre: Vec<f32> = dh
                    .iter()
                    .zip(&hb[t])
                    .map(|(&g, &hx)| g * (1.0 - hx * hx))
                    .collect();
                let gb = &mut grads.rnn[2 * layer + 1];
                add_assign(gb.b.row_mut(0), &dpre);
                gb.wx.add_outer(&input[t], &dpre);
                if t + 1 < w {
                    gb.wh.add_outer(&hb[t + 1], &dpre);
                }
                carry = bwd.wh.vecmul_t(&dpre);
                add_assign(&mut dinput[t], &bwd.wx.vecmul_t(&dpre));
            }

            dout = dinput;
        }

        // Convolution + embedding. `dout` now holds the gradient at the
        // post-ReLU convolution output.
        let mut demb: Vec<Vec<f32>> = vec![vec![0.0; e]; w];
        for t in 0..w {
            let dpre: Vec<f32> = dout[t]
                .iter()
                .zip(&cache.conv_pre[t])
                .map(|(&g, &z)| if z > 0.0 { g } else { 0.0 })
                .collect();
            add_assign(grads.conv_b.row_mut(0), &dpre);
            grads.conv_w.add_outer(&cache.patches[t], &dpre);
            let dpatch = p.conv_w.vecmul_t(&dpre);
            for kk in 0..k {
                let src = t as isize + kk as isize - half as isize;
                if src >= 0 && (src as usize) < w {
                    add_assign(&mut demb[src as usize], &dpatch[kk * e..(kk + 1) * e]);
                }
            }
        }
        for t in 0..w {
            add_assign(grads.embed.row_mut(cache.idx[t]), &demb[t]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> NeuralConfig {
        NeuralConfig {
            window: 5,
            embed_dim: 4,
            conv_channels: 5,
            kernel: 3,
            hidden_dim: 3,
            ff_hidden: 6,
            dropout: 0.0,
        }
    }

    fn loss_of(model: &CharModel, idx: &[usize], target: usize) -> f32 {
        let cache = model.forward(idx, None);
        let mut probs = cache.logits;
        softmax(&mut probs);
        -probs[target].max(1e-12).ln()
    }

    #[test]
    fn test_predict_is_a_distribution() {
        let model = CharModel::new(tiny_config(), 1);
        let probs = model.predict("HELLO").unwrap();
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-4);
        assert!(probs.iter().all(|&p| p >= 0.0));
    }

    #[test]
    fn test_predict_pads_short_context() {
        let model = CharModel::new(tiny_config(), 1);
        assert!(model.predict("").is_ok());
        assert!(model.predict("A").is_ok());
        // Truncation: only the last `window` symbols matter.
        let long = model.predict("XXXXXXABCDE").unwrap();
        let short = model.predict("ABCDE").unwrap();
        assert_eq!(long, short);
    }

    #[test]
    fn test_predict_rejects_out_of_alphabet() {
        let model = CharModel::new(tiny_config(), 1);
        assert!(model.predict("abc").is_err());
    }

    #[test]
    fn test_predict_deterministic() {
        let model = CharModel::new(tiny_config(), 42);
        assert_eq!(model.predict("FOO").unwrap(), model.predict("FOO").unwrap());
    }

    #[test]
    fn test_same_seed_same_model() {
        let a = CharModel::new(tiny_config(), 9);
        let b = CharModel::new(tiny_config(), 9);
        assert_eq!(a.params, b.params);
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let model = CharModel::new(tiny_config(), 3);
        let idx = vec![0usize, 7, 26, 4, 19];
        let target = 4usize;

        let cache = model.forward(&idx, None);
        let mut dlogits = cache.logits.clone();
        softmax(&mut dlogits);
        dlogits[target] -= 1.0;
        let mut grads = model.params.zeros_like();
        model.backward(&cache, &dlogits, &mut grads);

        // Central differences; a ReLU kink can throw off a single element,
        // so demand agreement per matrix rather than per element. A wrong
        // backward pass corrupts whole matrices, not lone entries.
        let eps = 5e-3f32;
        let mat_count = model.params.mats().len();
        let mut checked = 0;
        for mi in 0..mat_count {
            let mut mismatches = 0;
            let mut elems = 0;
            for ei in 0..3 {
                let analytic = {
                    let g = grads.mats()[mi];
                    if ei >= g.data.len() {
                        continue;
                    }
                    g.data[ei]
                };

                let mut probe = model.clone();
                probe.params.mats_mut()[mi].data[ei] += eps;
                let up = loss_of(&probe, &idx, target);
                probe.params.mats_mut()[mi].data[ei] -= 2.0 * eps;
                let down = loss_of(&probe, &idx, target);
                let numeric = (up - down) / (2.0 * eps);

                if (numeric - analytic).abs() > 5e-3 + 0.15 * analytic.abs() {
                    mismatches += 1;
                }
                elems += 1;
                checked += 1;
            }
            assert!(
                mismatches <= 1,
                "matrix {mi}: {mismatches}/{elems} gradient elements disagree with finite differences"
            );
        }
        assert!(checked > 30);
    }
}
