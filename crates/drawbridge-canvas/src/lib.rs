//! Canvas state: the authoritative element store and its export renderers.
//!
//! Everything here is synchronous and free of I/O. The engine wraps the
//! store in a lock and drives it from request handlers.

pub mod export;
pub mod query;
pub mod store;

pub use export::{render_scene, render_svg, ExportOptions, SceneDocument};
pub use query::ElementQuery;
pub use store::ElementStore;
