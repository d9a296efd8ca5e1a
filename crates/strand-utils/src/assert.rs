//! Assertions that stay cheap to fail in production. Debug builds panic;
//! release builds log through `tracing` and keep the stack alive, since a
//! transmit path that takes the process down over a bookkeeping slip is
//! worse than one that reports it.

/// Panic in debug builds, `tracing::error!` in release builds.
#[macro_export]
macro_rules! safe_panic {
    ($($arg:tt)*) => {{
        if cfg!(debug_assertions) {
            panic!($($arg)*);
        } else {
            tracing::error!($($arg)*);
        }
    }};
}

/// Invariant check built on [`safe_panic!`]: the condition is always
/// evaluated, the failure is fatal only in debug builds.
#[macro_export]
macro_rules! safe_assert {
    ($cond:expr $(,)?) => {
        if !$cond {
            $crate::safe_panic!("invariant broken: {}", stringify!($cond));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::safe_panic!($($arg)+);
        }
    };
}

/// Equality flavour of [`safe_assert!`], reporting both operands.
#[macro_export]
macro_rules! safe_assert_eq {
    ($left:expr, $right:expr $(,)?) => {{
        let (l, r) = (&$left, &$right);
        if l != r {
            $crate::safe_panic!(
                "invariant broken: {} == {} (left: {:?}, right: {:?})",
                stringify!($left),
                stringify!($right),
                l,
                r
            );
        }
    }};
    ($left:expr, $right:expr, $($arg:tt)+) => {{
        let (l, r) = (&$left, &$right);
        if l != r {
            $crate::safe_panic!($($arg)+);
        }
    }};
}
