use std::sync::Arc;

use crate::backend::Stores;
use crate::clock::{Clock, SystemClock};
use crate::config::CoordConfig;
use crate::observability::ObservabilityLayer;

/// Shared collaborators handed to every coordination component at construction
///
/// Cloning is cheap; all members are reference counted.
#[derive(Clone)]
pub struct CoordCtx {
    pub stores: Stores,
    pub clock: Arc<dyn Clock>,
    pub observability: Arc<ObservabilityLayer>,
    pub config: Arc<CoordConfig>,
}

impl CoordCtx {
    /// Context on the system clock with a fresh observability layer
    pub fn new(stores: Stores, config: CoordConfig) -> Self {
        Self {
            stores,
            clock: Arc::new(SystemClock),
            observability: Arc::new(ObservabilityLayer::new()),
            config: Arc::new(config),
        }
    }

    /// Replace the time source (tests use `ManualClock`)
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_observability(mut self, observability: Arc<ObservabilityLayer>) -> Self {
        self.observability = observability;
        self
    }

    pub fn config(&self) -> &CoordConfig {
        &self.config
    }
}
