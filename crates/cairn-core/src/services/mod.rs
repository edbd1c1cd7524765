//! Shared services for hosts embedding the stores

mod primary;

pub use primary::{PrimaryService, CHANGESET_FIELD};
