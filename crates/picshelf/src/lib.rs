//! picshelf: an image upload server in front of two object stores.
//!
//! Small images go to one backend and large images to another; identical
//! content is stored once. See [`shelfcas`] for the routing itself.

pub mod app;
pub mod telemetry;
pub mod web;

pub use app::AppContext;
pub use web::{router, WebState};
