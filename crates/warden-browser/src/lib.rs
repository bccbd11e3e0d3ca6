//! Browser automation over the Chrome DevTools Protocol.
//!
//! `cdp` holds the low-level WebSocket JSON-RPC client; `driver` builds the
//! page-level primitives the engine consumes (navigate, click by text or
//! selector, fill, select, waits, screenshots); `frame` implements the
//! main-frame-first focus guard; `overlay` injects and updates the control
//! top bar, border overlays, and visual cursor.

pub mod cdp;
pub mod driver;
pub mod error;
pub mod frame;
pub mod overlay;

pub use cdp::{discover_page_target, CdpClient, CdpEvent};
pub use driver::{PageDriver, TargetState};
pub use error::BrowserError;
