//! Random input generation for the equivalence check.

use rand::distributions::Uniform;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tract_onnx::prelude::*;

/// Shape of a single image fed to a classifier, batch size is always 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, new)]
pub struct InputShape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl InputShape {
    /// A RGB square image.
    pub fn square(size: usize) -> InputShape {
        InputShape::new(3, size, size)
    }

    /// Full NCHW shape.
    pub fn dims(&self) -> [usize; 4] {
        [1, self.channels, self.height, self.width]
    }

    pub fn volume(&self) -> usize {
        self.channels * self.height * self.width
    }
}

impl std::fmt::Display for InputShape {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.channels, self.height, self.width)
    }
}

/// Builds a NCHW f32 tensor of independent uniform draws in [0, 1).
///
/// Without a seed the generator is initialized from the system entropy source,
/// and two calls will produce different tensors.
pub fn random_input(shape: InputShape, seed: Option<u64>) -> TractResult<Tensor> {
    let mut rng = match seed {
        Some(seed) => SmallRng::seed_from_u64(seed),
        None => SmallRng::from_entropy(),
    };
    let uniform = Uniform::new(0f32, 1f32);
    let data: Vec<f32> = (0..shape.volume()).map(|_| rng.sample(uniform)).collect();
    debug!("Generated random input {:?} (seed: {:?})", shape.dims(), seed);
    Tensor::from_shape(&shape.dims(), &data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_in_unit_interval() {
        let t = random_input(InputShape::new(3, 8, 5), None).unwrap();
        assert_eq!(t.shape(), &[1, 3, 8, 5]);
        assert!(t.as_slice::<f32>().unwrap().iter().all(|x| (0.0..1.0).contains(x)));
    }

    #[test]
    fn seeded_is_reproducible() {
        let a = random_input(InputShape::square(16), Some(42)).unwrap();
        let b = random_input(InputShape::square(16), Some(42)).unwrap();
        let c = random_input(InputShape::square(16), Some(43)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
