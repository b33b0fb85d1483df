//! The `utils` module holds the pieces shared by every other module: the
//! crate-wide error type and logging initialisation.

pub mod error;
pub mod logging;

#[cfg(test)]
mod tests {
    use super::logging;
    use serial_test::serial;

    #[test]
    fn test_directives_normalise_level_names() {
        assert_eq!(logging::directives("DEBUG"), "debug");
        assert_eq!(logging::directives(" warning "), "warn");
        assert_eq!(logging::directives("off"), "off");
        assert_eq!(logging::directives("nonsense"), "info");
        assert_eq!(logging::directives("topicbus=debug,lapin=warn"), "topicbus=debug,lapin=warn");
    }

    #[test]
    #[serial]
    fn test_rust_log_overrides_configured_level() {
        temp_env::with_var("RUST_LOG", Some("lapin=warn"), || {
            assert_eq!(logging::filter("debug").to_string(), "lapin=warn");
        });
        temp_env::with_var_unset("RUST_LOG", || {
            assert_eq!(logging::filter("debug").to_string(), "debug");
        });
    }

    #[test]
    #[serial]
    fn test_init_accepts_any_level() {
        logging::init("info");
        logging::init("nonsense");
    }
}
