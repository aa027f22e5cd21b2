// Checks and result wrappers
//
// Two severities live here:
// - programmer errors: `gfx_assert!`, only checked in debug builds
// - soft failures: `LogOnError`, logged and then ignored
//
// Critical errors are plain `anyhow::Result`s that travel up to `main`.

/// Asserts a graphics-layer precondition.
///
/// Only evaluated when `debug_assertions` is on. The message is logged
/// before panicking so it also shows up next to the validation output.
#[macro_export]
macro_rules! gfx_assert {
    ($cond:expr, $($arg:tt)+) => {
        if cfg!(debug_assertions) && !($cond) {
            log::error!($($arg)+);
            panic!($($arg)+);
        }
    };
}

/// Log-only handling for results where a degraded path is fine
/// (debug labels, layer queries, best-effort idle waits on shutdown).
pub trait LogOnError<T> {
    fn log_on_error(self, what: &str) -> Option<T>;
}

impl<T, E: std::fmt::Display> LogOnError<T> for Result<T, E> {
    fn log_on_error(self, what: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("{}: {}", what, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_on_error_keeps_ok_values() {
        let ok: Result<u32, String> = Ok(7);
        assert_eq!(ok.log_on_error("query"), Some(7));

        let err: Result<u32, String> = Err("lost".to_string());
        assert_eq!(err.log_on_error("query"), None);
    }

    #[test]
    #[should_panic(expected = "size must be a multiple of 4")]
    fn gfx_assert_panics_in_debug_builds() {
        let size = 6;
        gfx_assert!(size % 4 == 0, "size must be a multiple of 4, got {}", size);
    }
}
