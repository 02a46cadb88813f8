/// Per-instruction tracing, compiled in only with the `vm-tracing-logging` feature.
macro_rules! vm_trace {
    ($($arg:tt)+) => {
        #[cfg(feature = "vm-tracing-logging")]
        {
            trace!($($arg)+);
        }
    };
}
