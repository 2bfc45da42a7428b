pub mod buffer;
#[macro_use]
pub mod error;
pub mod config;
pub mod epoch;
pub mod index;
pub mod lifetime;
pub mod session;
pub mod trx;

pub mod prelude {
    pub use crate::config::MasstreeConfig;
    pub use crate::error::*;
    pub use crate::index::scan::MasstreeScanner;
    pub use crate::index::storage::{IndexStatistics, MasstreeStorage};
    pub use crate::session::Session;
}
