//! HLS manifest handling: classification, resolution, link building and
//! the rewrite pass that ties them together.

pub mod classify;
pub mod link;
pub mod resolve;
pub mod rewrite;

pub use classify::{LineRole, PlaylistKind, ReferenceRole, classify_document, classify_line};
pub use link::{LinkBuilder, LinkMode};
pub use resolve::{base_directory, resolve};
pub use rewrite::{ResolvedReference, Rewritten, rewrite, rewrite_document};
