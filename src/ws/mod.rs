// =============================================================================
// WebSocket Session Manager + Message Router
// =============================================================================
//
// Two channels carry different drop policies because the cost of losing a
// message differs by kind:
//   - `ticks`: a `broadcast` channel with a bounded buffer. Under load a
//     slow subscriber falls behind and sees `Lagged`, which is fine — a
//     stale tick is superseded by the next one moments later.
//   - `executions`/`balances`: a `broadcast` channel with a much larger
//     buffer sized so a slow subscriber practically never lags. Losing an
//     execution silently would desync the position tracker, so this
//     channel is sized to absorb bursts rather than drop.
// =============================================================================

pub mod router;
pub mod session;

pub use router::{RouterEvent, WsEnvelope};
pub use session::{SessionManager, WsChannel};
