//! Process-wide logging setup. Library code logs through the `log` facade
//! and never touches this module itself — only the binary entry point
//! calls [`init`], so embedding this crate doesn't fight the host's own
//! logger.

pub fn init() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    pretty_env_logger::init();
}
