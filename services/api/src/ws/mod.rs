//! WebSocket Session Management
//!
//! A WebSocket connection carries one vocabulary session:
//!
//! - `protocol`: the JSON message format between client and server.
//! - `turn_io`: the `TurnIo` the phase agents talk through, fed by the socket.
//! - `session`: connection lifecycle, from the `init` frame to the session outcome.

pub mod protocol;
pub mod session;
pub mod turn_io;

pub use session::ws_handler;
