//! Single lazily-started tokio runtime used to drive the core crate's
//! async network and pairing APIs from synchronous C calls: an
//! `OnceLock<Runtime>` singleton, since the C ABI is synchronous but the
//! core crate's transport is not.

use std::sync::OnceLock;
use tokio::runtime::Runtime;

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

pub(crate) fn runtime() -> &'static Runtime {
    RUNTIME.get_or_init(|| Runtime::new().expect("failed to start tokio runtime"))
}
