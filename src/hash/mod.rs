mod extendible_hash;
mod identity;

pub use extendible_hash::*;
pub use identity::*;
