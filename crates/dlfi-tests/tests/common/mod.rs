use dlfi_core::KdfParams;
use dlfi_store::Archive;
use std::path::Path;

/// Open an archive with cheap argon2 costs so encryption tests stay fast.
pub fn open_archive(root: &Path) -> Archive {
    init_tracing();
    let archive = Archive::open(root).unwrap();
    archive
        .set_kdf_params(KdfParams {
            t_cost: 1,
            m_cost: 8,
            p_cost: 1,
        })
        .unwrap();
    archive
}

/// Log to the test harness; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
