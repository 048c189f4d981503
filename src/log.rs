//! Diagnostics through the `log` facade
//!
//! The macros compile to nothing unless the hidden `__log` feature is on.
//! Most messages come from the interrupt handler, so the logger must be quick,
//! and must not write over this USB peripheral.

macro_rules! log_macro {
    ($dollar:tt $name:ident) => {
        macro_rules! $name {
            ($dollar($dollar args:tt)*) => {
                #[cfg(feature = "__log")]
                ::__log::$name!($dollar($dollar args)*)
            };
        }
    };
}

// Setup packets, state changes, and endpoint declarations
log_macro!($ debug);
// Requests and declarations the engine refuses
log_macro!($ warn);
// Per-packet traffic
log_macro!($ trace);
