//! Domain services used by the websocket gateway.
//!
//! ARCHITECTURE
//! ============
//! Service modules own room and game state mutation so the gateway can stay
//! focused on protocol translation. Every mutating operation runs under the
//! rooms map write lock and fans out its broadcast inside the same critical
//! section, which is what keeps delivery order equal to application order.

pub mod presence;
pub mod puzzle;
pub mod room;
pub mod sweeper;
pub mod whiteboard;
