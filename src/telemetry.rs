//! Optional tracing setup behind the `otel` feature. The launcher stays
//! silent unless the operator opts in; the default build compiles this module
//! down to a no-op.

#[cfg(feature = "otel")]
mod enabled {
    use once_cell::sync::OnceCell;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    static INIT: OnceCell<()> = OnceCell::new();

    /// Install a fmt subscriber on stderr. RUST_LOG controls the filter;
    /// the default keeps only the launcher's own spans at info.
    pub fn init_tracing() {
        INIT.get_or_init(|| {
            let filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("meshrun=info"));
            let fmt = tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false);
            tracing_subscriber::registry().with(filter).with(fmt).init();
        });
    }
}

#[cfg(feature = "otel")]
pub use enabled::init_tracing;

#[cfg(not(feature = "otel"))]
pub fn init_tracing() {}

#[cfg(test)]
mod tests {
    #[test]
    fn test_init_tracing_is_idempotent() {
        super::init_tracing();
        super::init_tracing();
    }
}
