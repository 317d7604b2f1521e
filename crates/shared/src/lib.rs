pub mod cursor;
pub mod domain;
pub mod error;
pub mod protocol;
pub mod reactions;
pub mod validate;
