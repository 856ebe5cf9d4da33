#![allow(unused_macros)]

#[cfg(feature = "defmt-logging")]
macro_rules! node_log {
    (trace,   $($arg:expr),*) => { defmt::trace!($($arg),*) };
    (debug,   $($arg:expr),*) => { defmt::debug!($($arg),*) };
    (info,    $($arg:expr),*) => { defmt::info!($($arg),*) };
    (warn,    $($arg:expr),*) => { defmt::warn!($($arg),*) };
    (error,   $($arg:expr),*) => { defmt::error!($($arg),*) };
    (println, $($arg:expr),*) => { defmt::println!($($arg),*) };
}

#[cfg(not(feature = "defmt-logging"))]
macro_rules! node_log {
    ($level:ident, $($arg:expr),*) => {{ $( let _ = $arg; )* }}
}

macro_rules! node_trace {
    ($($arg:expr),*) => (node_log!(trace, $($arg),*));
}

macro_rules! node_debug {
    ($($arg:expr),*) => (node_log!(debug, $($arg),*));
}

macro_rules! node_info {
    ($($arg:expr),*) => (node_log!(info, $($arg),*));
}

macro_rules! node_warn {
    ($($arg:expr),*) => (node_log!(warn, $($arg),*));
}

macro_rules! node_error {
    ($($arg:expr),*) => (node_log!(error, $($arg),*));
}

macro_rules! node_println {
    ($($arg:expr),*) => (node_log!(println, $($arg),*));
}
