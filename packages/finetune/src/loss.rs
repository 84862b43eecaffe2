use crate::autograd::{Act, Tape};

/// Consumes the two projected batches and yields a scalar loss on the tape.
pub trait Criterion {
    fn loss(&self, tape: &mut Tape, z1: &[Act], z2: &[Act]) -> Act;
}

/// NT-Xent: the partner view is the positive, the other `2N - 2` views of the
/// batch are negatives.
#[derive(Debug, Clone, Copy)]
pub struct NtXent {
    temperature: f64,
}

impl NtXent {
    pub fn new(temperature: f64) -> Self {
        assert!(
            temperature.is_finite() && temperature > 0.0,
            "temperature must be > 0"
        );
        Self { temperature }
    }
}

impl Criterion for NtXent {
    fn loss(&self, tape: &mut Tape, z1: &[Act], z2: &[Act]) -> Act {
        assert_eq!(z1.len(), z2.len(), "view batches differ in size");
        let normalized = z1
            .iter()
            .chain(z2)
            .map(|z| tape.l2_normalize(*z))
            .collect::<Vec<_>>();
        tape.nt_xent(&normalized, self.temperature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loss_is_lower_for_matching_views() {
        let criterion = NtXent::new(0.1);

        let mut tape = Tape::new();
        let a = tape.constant(vec![1.0, 0.0, 0.0]);
        let b = tape.constant(vec![0.0, 1.0, 0.0]);
        let a2 = tape.constant(vec![0.9, 0.1, 0.0]);
        let b2 = tape.constant(vec![0.1, 0.9, 0.0]);
        let matched = criterion.loss(&mut tape, &[a, b], &[a2, b2]);
        let swapped = criterion.loss(&mut tape, &[a, b], &[b2, a2]);

        assert!(tape.scalar(matched) < tape.scalar(swapped));
    }

    #[test]
    fn loss_ignores_embedding_scale() {
        let criterion = NtXent::new(0.5);
        let mut tape = Tape::new();
        let a = tape.constant(vec![1.0, 2.0]);
        let b = tape.constant(vec![-1.0, 0.5]);
        let c = tape.constant(vec![0.3, -0.4]);
        let d = tape.constant(vec![2.0, 1.0]);
        let base = criterion.loss(&mut tape, &[a, c], &[b, d]);
        let a_big = tape.constant(vec![10.0, 20.0]);
        let scaled = criterion.loss(&mut tape, &[a_big, c], &[b, d]);

        assert!((tape.scalar(base) - tape.scalar(scaled)).abs() < 1e-12);
    }

    #[test]
    fn single_pair_loss_is_zero() {
        // with one pair the only candidate is the positive
        let criterion = NtXent::new(0.1);
        let mut tape = Tape::new();
        let a = tape.constant(vec![1.0, 0.0]);
        let b = tape.constant(vec![0.0, 1.0]);
        let loss = criterion.loss(&mut tape, &[a], &[b]);
        assert!(tape.scalar(loss).abs() < 1e-12);
    }
}
