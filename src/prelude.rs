//! The `ibvnic` prelude.
//!
//! The purpose of this module is to alleviate imports of the types needed to
//! run an engine instance.

pub use crate::config::{DriverConfig, PathConfig, VnicConfig};
pub use crate::control::wire::Statistics;
pub use crate::data::{RxFrame, TxCsumFlags, XmitError};
pub use crate::driver::{Driver, DriverError};
pub use crate::sim::{EiocConfig, SimEioc, SimTransport};
pub use crate::transport::{Connection, Gid, Transport};
pub use crate::viport::{LinkState, ViportId};
pub use crate::vnic::{PathRole, Upstream, VnicHandle};
