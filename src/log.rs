//! Thin wrappers around the `log` crate's macros.
//!
//! Kept as a separate module so the rest of the crate never names the
//! `log` crate directly and a different diagnostic sink could be swapped
//! in behind this one seam.

macro_rules! trace {
    ($($arg:tt)*) => { ::log::trace!($($arg)*) };
}

macro_rules! debug {
    ($($arg:tt)*) => { ::log::debug!($($arg)*) };
}

macro_rules! info {
    ($($arg:tt)*) => { ::log::info!($($arg)*) };
}

macro_rules! warning {
    ($($arg:tt)*) => { ::log::warn!($($arg)*) };
}

macro_rules! error {
    ($($arg:tt)*) => { ::log::error!($($arg)*) };
}

#[allow(unused_imports)]
pub(crate) use debug;
#[allow(unused_imports)]
pub(crate) use error;
#[allow(unused_imports)]
pub(crate) use info;
#[allow(unused_imports)]
pub(crate) use trace;
#[allow(unused_imports)]
pub(crate) use warning;
