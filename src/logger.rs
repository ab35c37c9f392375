use std::sync::Once;

static INIT: Once = Once::new();

const DEFAULT_FILTER: &str = "uvc_gadget=info";

/// Installs the timed pretty logger once per process. `RUST_LOG` wins over
/// the default filter when set.
pub fn setup_logger() {
    INIT.call_once(|| {
        let mut builder = pretty_env_logger::formatted_timed_builder();
        match std::env::var("RUST_LOG") {
            Ok(filters) => builder.parse_filters(&filters),
            Err(_) => builder.parse_filters(DEFAULT_FILTER),
        };
        if let Err(e) = builder.try_init() {
            eprintln!("logger already installed: {}", e);
        }
    });
}
