use std::sync::OnceLock;

/// Trace every reference-count transition of every allocation.
pub(crate) fn refcount_tracing() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        std::env::var_os("TENSORFLOW_DEBUG_PLUGGABLE_DEVICE_REFERENCE_COUNTING").is_some()
    })
}

/// Log per-flush compile/encode timings and fusion ratios.
pub(crate) fn profiling_tracing() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        std::env::var_os("TENSORFLOW_DEBUG_PLUGGABLE_DEVICE_PROFILING_ENCODING").is_some()
    })
}
