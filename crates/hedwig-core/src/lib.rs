pub mod attachment;
pub mod error;
pub mod product;
pub mod state;

pub use attachment::{checksum, Attachment, AttachmentKind, OwnerRef};
pub use error::HedwigError;
pub use state::{AttachmentState, Transition, TransitionError};
