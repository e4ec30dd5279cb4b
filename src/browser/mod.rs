//! Browser management

pub mod control;
pub mod driver;
pub mod errors;

pub use control::{CdpPage, ElementProbe, PageControl, PageState};
pub use driver::{
    CdpLauncher, DriverConstraints, DriverHandle, DriverService, DriverStrategy, Launcher,
};
pub use errors::BrowserError;
