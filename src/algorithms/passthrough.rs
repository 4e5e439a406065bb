//! Forwarding algorithm.
//!
//! Emits every input unchanged on output slot 0. Used to exercise controller
//! plumbing and as the identity stage in diagnostic streams.

use crate::algorithms::{Algorithm, AlgorithmContext};
use crate::core::params::ParameterRegistry;
use crate::messages::header::NativeMessage;
use anyhow::Result;
use std::sync::Arc;

pub struct Passthrough {
    processed: u64,
}

impl Passthrough {
    pub fn new() -> Self {
        Self { processed: 0 }
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }
}

impl Default for Passthrough {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for Passthrough {
    fn startup(&mut self, _params: &mut ParameterRegistry) -> Result<()> {
        Ok(())
    }

    fn process(
        &mut self,
        message: &Arc<dyn NativeMessage>,
        _slot: usize,
        ctx: &mut AlgorithmContext,
    ) -> bool {
        self.processed += 1;
        ctx.send(message.clone(), 0)
    }
}
