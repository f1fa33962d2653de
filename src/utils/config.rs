//! Configuration parameters struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// given fields by parsing from given TOML string if it's not `None`. Returns
/// an `Ok(config)` on success, and `Err(AcsError)` on parser failure.
///
/// Example:
/// ```no_compile
/// let config = parsed_config!(config_str => AcsdConfig; listen_port)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, AcsError> {
            let mut config: $config_type = Default::default();
            if let None = config_str {
                return Ok(config);
            }

            let mut table = config_str.unwrap().parse::<toml::Table>()?;

            // traverse through all given field names
            $({
                // if field name found in table (and removed)
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // if table is not empty at this time, some parsed keys are not
            // expected hence invalid
            if table.len() > 0 {
                return Err(AcsError::Msg(format!(
                    "invalid field name '{}' in config",
                    table.keys().next().unwrap(),
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::utils::AcsError;

    #[derive(Debug, PartialEq)]
    struct TestConfig {
        interval: u16,
        endpoint: String,
        backoff: f64,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            TestConfig {
                interval: 10,
                endpoint: "127.0.0.1".into(),
                backoff: 1.5,
            }
        }
    }

    #[test]
    fn parse_from_none() -> Result<(), AcsError> {
        let config =
            parsed_config!(None => TestConfig; interval, endpoint, backoff)?;
        let ref_config: TestConfig = Default::default();
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_from_partial() -> Result<(), AcsError> {
        let config_str = Some("endpoint = 'localhost'");
        let config =
            parsed_config!(config_str => TestConfig; endpoint, backoff)?;
        let ref_config = TestConfig {
            interval: 10,
            endpoint: "localhost".into(),
            backoff: 1.5,
        };
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_invalid_field() {
        let config_str = Some("xyz = 999");
        assert!(parsed_config!(config_str => TestConfig; interval).is_err());
    }
}
