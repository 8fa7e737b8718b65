//! Host-domain collaborators
//!
//! The note, user, attachment and preference repositories that plugin
//! facades delegate to once a call has been authorized. Persistence lives in
//! the host service; this crate defines the contract and ships in-memory
//! implementations used by tests and the CLI demo host.

pub mod attachments;
pub mod notes;
pub mod preferences;
pub mod users;

pub use attachments::{AttachmentMeta, AttachmentRepository, InMemoryAttachmentRepository};
pub use notes::{InMemoryNoteRepository, NewNote, Note, NoteRepository, NoteUpdate};
pub use preferences::{InMemoryPreferenceRepository, PreferenceRepository};
pub use users::{InMemoryUserRepository, ProfileUpdate, User, UserRepository};
