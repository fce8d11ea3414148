//! # backline-core: shared data model for collaborative production documents
//!
//! Plain data types exchanged between the persistence engine
//! (`backline-collab`), its transports and the editing surface.
//! Nothing in this crate performs I/O.
//!
//! ## Modules
//!
//! - [`document`]: document identity, kinds and field maps
//! - [`update`]: field deltas, write intents and their origin tag
//! - [`conflict`]: per-field conflicts and their resolution
//! - [`status`]: save-status state machine and connection status
//! - [`presence`]: collaborator presence records and stable colours

pub mod document;
pub mod update;
pub mod conflict;
pub mod status;
pub mod presence;

pub use document::{DocumentId, DocumentType, FieldMap, ShareScope, UserId, UPDATED_AT_FIELD};
pub use update::{deltas_to_fields, DocumentUpdate, FieldDelta, UpdateOrigin};
pub use conflict::{
    ConflictResolution, ConflictSide, DocumentConflict, ResolutionChoice,
    ResolvedFields,
};
pub use status::{ConnectionStatus, InvalidTransition, SaveEvent, SaveStatus};
pub use presence::{PresenceColor, PresenceState, PresenceUser};
