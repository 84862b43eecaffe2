use std::f64::consts::PI;

pub type Act = usize;

#[derive(Clone, Debug)]
pub struct Rng {
    state: u64,
}

impl Rng {
    pub fn new(seed: u64) -> Self {
        // xorshift never leaves the all-zero state
        let state = if seed == 0 { 0x9e37_79b9_7f4a_7c15 } else { seed };
        Self { state }
    }

    /// Independent stream keyed by `seed` and a path of stream ids, e.g.
    /// `(seed, [epoch, index])` for per-sample augmentation.
    pub fn derive(seed: u64, stream: &[u64]) -> Self {
        let mut h = splitmix64(seed);
        for id in stream {
            h = splitmix64(h ^ id.wrapping_mul(0xbf58_476d_1ce4_e5b9));
        }
        Self::new(h)
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    pub fn uniform(&mut self, low: f64, high: f64) -> f64 {
        low + (high - low) * self.next_f64()
    }

    pub fn below(&mut self, n: usize) -> usize {
        assert!(n > 0, "below requires n > 0");
        (self.next_u64() % n as u64) as usize
    }

    pub fn bernoulli(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.below(i + 1);
            items.swap(i, j);
        }
    }

    pub fn gauss(&mut self, mean: f64, std: f64) -> f64 {
        let u1 = self.next_f64().max(1e-10);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
        mean + std * z
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

#[derive(Clone, Debug)]
pub struct Param {
    pub data: Vec<f64>,
    pub grad: Vec<f64>,
    pub rows: usize,
    pub cols: usize,
}

impl Param {
    pub fn matrix(rng: &mut Rng, rows: usize, cols: usize, std: f64) -> Self {
        let n = rows * cols;
        let data = (0..n).map(|_| rng.gauss(0.0, std)).collect();
        Self {
            data,
            grad: vec![0.0; n],
            rows,
            cols,
        }
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        let n = rows * cols;
        Self {
            data: vec![0.0; n],
            grad: vec![0.0; n],
            rows,
            cols,
        }
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    pub fn is_vector(&self) -> bool {
        self.rows == 1
    }
}

#[derive(Clone, Debug)]
enum Op {
    Embed {
        param: usize,
        row: usize,
        out: Act,
    },
    VecAdd {
        a: Act,
        b: Act,
        out: Act,
    },
    MatVec {
        param: usize,
        x: Act,
        out: Act,
    },
    Relu {
        x: Act,
        out: Act,
    },
    L2Normalize {
        x: Act,
        out: Act,
        norm: f64,
    },
    NtXent {
        inputs: Vec<Act>,
        out: Act,
        temperature: f64,
        probs: Vec<f64>,
    },
}

#[derive(Debug)]
pub struct Tape {
    params: Vec<Param>,
    act_data: Vec<Vec<f64>>,
    act_grad: Vec<Vec<f64>>,
    ops: Vec<Op>,
    grad_enabled: bool,
}

impl Default for Tape {
    fn default() -> Self {
        Self::new()
    }
}

impl Tape {
    pub fn new() -> Self {
        Self {
            params: Vec::new(),
            act_data: Vec::new(),
            act_grad: Vec::new(),
            ops: Vec::new(),
            grad_enabled: true,
        }
    }

    pub fn add_param(&mut self, p: Param) -> usize {
        let idx = self.params.len();
        self.params.push(p);
        idx
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut [Param] {
        &mut self.params
    }

    /// Disabling gradients stops op recording; activations are still computed.
    pub fn set_grad_enabled(&mut self, enabled: bool) {
        self.grad_enabled = enabled;
    }

    pub fn grad_enabled(&self) -> bool {
        self.grad_enabled
    }

    pub fn reset(&mut self) {
        self.act_data.clear();
        self.act_grad.clear();
        self.ops.clear();
        for p in &mut self.params {
            p.zero_grad();
        }
    }

    /// Drops activations and recorded ops but keeps accumulated parameter gradients.
    pub fn clear_activations(&mut self) {
        self.act_data.clear();
        self.act_grad.clear();
        self.ops.clear();
    }

    fn alloc(&mut self, size: usize) -> Act {
        let idx = self.act_data.len();
        self.act_data.push(vec![0.0; size]);
        let grad = if self.grad_enabled {
            vec![0.0; size]
        } else {
            Vec::new()
        };
        self.act_grad.push(grad);
        idx
    }

    fn record(&mut self, op: Op) {
        if self.grad_enabled {
            self.ops.push(op);
        }
    }

    pub fn recorded_ops(&self) -> usize {
        self.ops.len()
    }

    pub fn constant(&mut self, values: Vec<f64>) -> Act {
        let out = self.alloc(values.len());
        self.act_data[out] = values;
        out
    }

    pub fn value(&self, act: Act) -> &[f64] {
        &self.act_data[act]
    }

    pub fn scalar(&self, act: Act) -> f64 {
        self.act_data[act][0]
    }

    fn assert_same_len(&self, a: Act, b: Act) {
        assert_eq!(
            self.act_data[a].len(),
            self.act_data[b].len(),
            "shape mismatch: {} != {}",
            self.act_data[a].len(),
            self.act_data[b].len()
        );
    }

    pub fn vec_add(&mut self, a: Act, b: Act) -> Act {
        self.assert_same_len(a, b);
        let n = self.act_data[a].len();
        let out = self.alloc(n);
        for i in 0..n {
            self.act_data[out][i] = self.act_data[a][i] + self.act_data[b][i];
        }
        self.record(Op::VecAdd { a, b, out });
        out
    }

    pub fn embed_row(&mut self, param: usize, row: usize) -> Act {
        let cols = self.params[param].cols;
        assert!(
            row < self.params[param].rows,
            "row {} out of bounds for embedding rows {}",
            row,
            self.params[param].rows
        );
        let out = self.alloc(cols);
        let start = row * cols;
        self.act_data[out].copy_from_slice(&self.params[param].data[start..start + cols]);
        self.record(Op::Embed { param, row, out });
        out
    }

    pub fn matvec(&mut self, param: usize, x: Act) -> Act {
        let rows = self.params[param].rows;
        let cols = self.params[param].cols;
        assert_eq!(
            self.act_data[x].len(),
            cols,
            "matvec input width mismatch: {} != {}",
            self.act_data[x].len(),
            cols
        );
        let out = self.alloc(rows);
        for r in 0..rows {
            let row_start = r * cols;
            let weights = &self.params[param].data[row_start..row_start + cols];
            let sum = weights
                .iter()
                .zip(&self.act_data[x])
                .map(|(w, v)| w * v)
                .sum();
            self.act_data[out][r] = sum;
        }
        self.record(Op::MatVec { param, x, out });
        out
    }

    pub fn relu(&mut self, x: Act) -> Act {
        let n = self.act_data[x].len();
        let out = self.alloc(n);
        for i in 0..n {
            self.act_data[out][i] = self.act_data[x][i].max(0.0);
        }
        self.record(Op::Relu { x, out });
        out
    }

    pub fn l2_normalize(&mut self, x: Act) -> Act {
        let n = self.act_data[x].len();
        assert!(n > 0, "l2_normalize requires non-empty input");
        let out = self.alloc(n);
        let norm = dot(&self.act_data[x], &self.act_data[x]).sqrt().max(1e-12);
        for i in 0..n {
            self.act_data[out][i] = self.act_data[x][i] / norm;
        }
        self.record(Op::L2Normalize { x, out, norm });
        out
    }

    /// Normalized temperature-scaled cross entropy over `2N` unit vectors.
    ///
    /// Row `i` and row `(i + N) % 2N` are the positive pair; every other row
    /// in the batch is a negative. Self-similarity is excluded from the
    /// softmax denominator. The result is the mean over all `2N` anchors.
    pub fn nt_xent(&mut self, inputs: &[Act], temperature: f64) -> Act {
        let n2 = inputs.len();
        assert!(
            n2 >= 2 && n2 % 2 == 0,
            "nt_xent requires an even number (>= 2) of embeddings, got {n2}"
        );
        assert!(temperature > 0.0, "temperature must be > 0");
        for input in inputs {
            self.assert_same_len(inputs[0], *input);
        }

        let half = n2 / 2;
        let mut probs = vec![0.0; n2 * n2];
        let mut total = 0.0;
        for i in 0..n2 {
            let positive = (i + half) % n2;
            let logits = (0..n2)
                .map(|k| {
                    if k == i {
                        f64::NEG_INFINITY
                    } else {
                        dot(&self.act_data[inputs[i]], &self.act_data[inputs[k]]) / temperature
                    }
                })
                .collect::<Vec<_>>();
            let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let sum = logits
                .iter()
                .map(|l| (l - max).exp())
                .sum::<f64>();
            let lse = max + sum.ln();
            total += lse - logits[positive];
            for k in 0..n2 {
                if k != i {
                    probs[i * n2 + k] = (logits[k] - lse).exp();
                }
            }
        }

        let out = self.alloc(1);
        self.act_data[out][0] = total / n2 as f64;
        self.record(Op::NtXent {
            inputs: inputs.to_vec(),
            out,
            temperature,
            probs,
        });
        out
    }

    pub fn backward(&mut self, loss: Act) {
        assert!(self.grad_enabled, "backward called with gradients disabled");
        assert_eq!(self.act_data[loss].len(), 1, "loss must be scalar");
        self.act_grad[loss][0] = 1.0;

        let ops = std::mem::take(&mut self.ops);
        for op in ops.into_iter().rev() {
            match op {
                Op::Embed { param, row, out } => {
                    let cols = self.params[param].cols;
                    let start = row * cols;
                    for c in 0..cols {
                        self.params[param].grad[start + c] += self.act_grad[out][c];
                    }
                }
                Op::VecAdd { a, b, out } => {
                    for i in 0..self.act_data[out].len() {
                        let g = self.act_grad[out][i];
                        self.act_grad[a][i] += g;
                        self.act_grad[b][i] += g;
                    }
                }
                Op::MatVec { param, x, out } => {
                    let rows = self.params[param].rows;
                    let cols = self.params[param].cols;
                    for r in 0..rows {
                        let go = self.act_grad[out][r];
                        if go == 0.0 {
                            continue;
                        }
                        let row_start = r * cols;
                        for c in 0..cols {
                            self.params[param].grad[row_start + c] += go * self.act_data[x][c];
                            self.act_grad[x][c] += go * self.params[param].data[row_start + c];
                        }
                    }
                }
                Op::Relu { x, out } => {
                    for i in 0..self.act_data[out].len() {
                        if self.act_data[x][i] > 0.0 {
                            self.act_grad[x][i] += self.act_grad[out][i];
                        }
                    }
                }
                Op::L2Normalize { x, out, norm } => {
                    let y = &self.act_data[out];
                    let gy = &self.act_grad[out];
                    let proj = dot(y, gy);
                    let gx = y
                        .iter()
                        .zip(gy)
                        .map(|(yi, gi)| (gi - yi * proj) / norm)
                        .collect::<Vec<_>>();
                    for (acc, g) in self.act_grad[x].iter_mut().zip(gx) {
                        *acc += g;
                    }
                }
                Op::NtXent {
                    inputs,
                    out,
                    temperature,
                    probs,
                } => {
                    let n2 = inputs.len();
                    let half = n2 / 2;
                    let upstream = self.act_grad[out][0] / (n2 as f64 * temperature);
                    // coupling[i][k] = G_ik + G_ki with G_ik = p_ik - [k is positive of i]
                    let mut coupling = vec![0.0; n2 * n2];
                    for i in 0..n2 {
                        let positive = (i + half) % n2;
                        for k in 0..n2 {
                            if k == i {
                                continue;
                            }
                            let target = if k == positive { 1.0 } else { 0.0 };
                            let g = upstream * (probs[i * n2 + k] - target);
                            coupling[i * n2 + k] += g;
                            coupling[k * n2 + i] += g;
                        }
                    }
                    for i in 0..n2 {
                        let mut gi = vec![0.0; self.act_data[inputs[i]].len()];
                        for k in 0..n2 {
                            let c = coupling[i * n2 + k];
                            if c == 0.0 {
                                continue;
                            }
                            for (g, v) in gi.iter_mut().zip(&self.act_data[inputs[k]]) {
                                *g += c * v;
                            }
                        }
                        for (acc, g) in self.act_grad[inputs[i]].iter_mut().zip(gi) {
                            *acc += g;
                        }
                    }
                }
            }
        }
    }

    pub fn grad(&self, act: Act) -> &[f64] {
        &self.act_grad[act]
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
