//! Domain types for the OTrade engine

pub mod account;
pub mod bar;
pub mod ids;
pub mod position;
pub mod signal;
pub mod timeframe;

pub use account::{AccountState, SymbolConstraints};
pub use bar::{is_chronological, Bar, Tick};
pub use ids::{ConfigHash, PatternId, TicketId};
pub use position::{ClosedTrade, ExitReason, Position, PositionState, TrailingState};
pub use signal::{Decision, Direction, OrderPlan, TrailingPolicy};
pub use timeframe::{Timeframe, TimeframeParseError};

/// Symbol type alias
pub type Symbol = String;
