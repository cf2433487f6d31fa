#![allow(unused_macros)]

#[cfg(feature = "defmt-logging")]
macro_rules! spine_log {
    (trace, $($arg:expr),*) => { defmt::trace!($($arg),*) };
    (debug, $($arg:expr),*) => { defmt::debug!($($arg),*) };
    (info,  $($arg:expr),*) => { defmt::info!($($arg),*) };
    (warn,  $($arg:expr),*) => { defmt::warn!($($arg),*) };
    (error, $($arg:expr),*) => { defmt::error!($($arg),*) };
}

#[cfg(all(feature = "log-logging", not(feature = "defmt-logging")))]
macro_rules! spine_log {
    (trace, $($arg:expr),*) => { log::trace!($($arg),*) };
    (debug, $($arg:expr),*) => { log::debug!($($arg),*) };
    (info,  $($arg:expr),*) => { log::info!($($arg),*) };
    (warn,  $($arg:expr),*) => { log::warn!($($arg),*) };
    (error, $($arg:expr),*) => { log::error!($($arg),*) };
}

#[cfg(not(any(feature = "defmt-logging", feature = "log-logging")))]
macro_rules! spine_log {
    ($level:ident, $($arg:expr),*) => {{ $( let _ = $arg; )* }}
}

macro_rules! spine_trace {
    ($($arg:expr),*) => (spine_log!(trace, $($arg),*));
}

macro_rules! spine_debug {
    ($($arg:expr),*) => (spine_log!(debug, $($arg),*));
}

macro_rules! spine_info {
    ($($arg:expr),*) => (spine_log!(info, $($arg),*));
}

macro_rules! spine_warn {
    ($($arg:expr),*) => (spine_log!(warn, $($arg),*));
}

macro_rules! spine_error {
    ($($arg:expr),*) => (spine_log!(error, $($arg),*));
}
