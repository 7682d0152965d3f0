//! Media processing for the upload pipeline
//!
//! Validation of staged files and, with the `image` feature, image
//! introspection and thumbnail derivation.

pub mod filename;
#[cfg(feature = "image")]
pub mod imaging;
pub mod validator;

pub use filename::sanitize_filename;
#[cfg(feature = "image")]
pub use imaging::{ImageDerivatives, ImageProcessor, Thumbnail};
pub use validator::{MediaValidator, ValidationError};
