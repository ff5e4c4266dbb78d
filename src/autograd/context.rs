//! Execution context for a forward pass

use rand::rngs::StdRng;
use rand::SeedableRng;

/// Forward-pass context: training mode and the dropout random stream
pub struct Context {
    training: bool,
    rng: StdRng,
}

impl Context {
    /// Create a training context with a seeded random stream
    pub fn new(seed: u64) -> Self {
        Self {
            training: true,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Set training mode
    pub fn train(&mut self) {
        self.training = true;
    }

    /// Set evaluation mode
    pub fn eval(&mut self) {
        self.training = false;
    }

    /// Check if in training mode
    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Random stream used by dropout
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(0)
    }
}
