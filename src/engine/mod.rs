pub mod command;
pub mod types;

use anyhow::Result;

pub use command::CommandEngine;
pub use types::{Conversion, EngineDiag, MetaValue};

/// Black-box document converter: raw document bytes in, markdown + metadata out.
pub trait Engine {
    fn doctor(&self) -> Result<EngineDiag>;
    fn convert(&self, document: &[u8]) -> Result<Conversion>;
}

impl<T: Engine + ?Sized> Engine for &T {
    fn doctor(&self) -> Result<EngineDiag> {
        (**self).doctor()
    }

    fn convert(&self, document: &[u8]) -> Result<Conversion> {
        (**self).convert(document)
    }
}
