//! Sample-offset algorithm.
//!
//! Adds a configurable constant to every sample of incoming video radials.
//! Small enough to read in one sitting, which makes it the usual example for
//! writing new algorithms: one runtime parameter, one derived output.

use crate::algorithms::{Algorithm, AlgorithmContext};
use crate::core::params::{Parameter, ParameterRegistry};
use crate::messages::header::NativeMessage;
use crate::messages::video::Video;
use anyhow::Result;
use std::sync::Arc;

pub struct Offset {
    offset: i64,
}

impl Offset {
    pub fn new() -> Self {
        Self { offset: 0 }
    }
}

impl Default for Offset {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for Offset {
    fn startup(&mut self, params: &mut ParameterRegistry) -> Result<()> {
        params.register(Parameter::int_value("offset", "Sample Offset", 0));
        Ok(())
    }

    fn end_parameter_changes(&mut self, params: &ParameterRegistry) {
        self.offset = params.get_int("offset").unwrap_or(0);
    }

    fn process(
        &mut self,
        message: &Arc<dyn NativeMessage>,
        _slot: usize,
        ctx: &mut AlgorithmContext,
    ) -> bool {
        // Pick up edits applied outside a bracketed change as well.
        self.offset = ctx.params.get_int("offset").unwrap_or(self.offset);

        let Some(video) = message.as_any().downcast_ref::<Video>() else {
            tracing::error!("expected Video input");
            return false;
        };

        let offset = self.offset as i16;
        let samples = video
            .samples()
            .iter()
            .map(|s| s.saturating_add(offset))
            .collect();

        match Video::derived("Offset", message.clone(), samples) {
            Ok(out) => ctx.send(Arc::new(out), 0),
            Err(err) => {
                tracing::error!(error = %err, "failed to derive output");
                false
            }
        }
    }
}
