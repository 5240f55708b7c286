//! Correction overlay
//!
//! Human corrections live beside the raw extraction, never inside it:
//! - `records`: the closed set of correction kinds, with scope and target key
//! - `store`: append-only JSONL streams, one per device and kind
//! - `scope`: shared scope configuration and the per-pass resolution context
//! - `resolver`: device → vendor → standard → global lookups
//! - `regenerate`: pure recomputation of derived outputs

pub mod records;
pub mod regenerate;
pub mod resolver;
pub mod scope;
pub mod store;

pub use records::{validate_owner, CorrectionKind, CorrectionPayload, CorrectionRecord, Scope};
pub use regenerate::{regenerate, DerivedBlock, DerivedEntity, DerivedOutputs, DerivedPage};
pub use resolver::{CategoryResolution, RegenerationReport, Resolution};
pub use scope::{GlobalPattern, ResolutionContext, ScopeConfig};
pub use store::{CorrectionFilter, CorrectionSet, CorrectionStore};
