//! Hot data plane: tick validation and enrichment, bar aggregation and
//! the out-of-hours mock generator.

pub mod bars;
pub mod mock;
pub mod ticks;

pub use bars::BarAggregator;
pub use mock::MockGenerator;
pub use ticks::{market_open_now, TickPipeline};
