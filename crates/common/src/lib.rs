pub mod clock;
pub mod collector;
pub mod config;
pub mod error;
pub mod store;
pub mod types;

pub use clock::{Clock, FakeClock, SystemClock};
pub use collector::{CollectionOutcome, MacroCollector, OhlcCollector};
pub use config::Config;
pub use error::{CollectionError, Error, ErrorKind, Result};
pub use store::{Store, StoreHealth};
pub use types::*;
